//! Execution plan for a workflow's stage graph.
//!
//! Validates the graph (unique names, known dependencies, no cycles, well-formed
//! conditions) and computes a stable topological order in which declaration
//! order breaks ties.

use std::collections::{BTreeSet, HashMap};

use sandflow_core::{Error, Result, StageStatus, WorkflowDefinition};

use crate::condition::Expression;

/// Validated stage graph of one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    names: Vec<String>,
    /// Indices of each stage's dependencies.
    dependencies: Vec<Vec<usize>>,
    /// Stage indices in execution order.
    order: Vec<usize>,
}

impl ExecutionPlan {
    /// Build the plan, rejecting any malformed graph with `InvalidWorkflow`.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self> {
        if workflow.stages.is_empty() {
            return Err(Error::invalid_workflow(format!(
                "workflow '{}' has no stages",
                workflow.name
            )));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in workflow.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(Error::invalid_workflow(format!("stage #{} has no name", i + 1)));
            }
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(Error::invalid_workflow(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(workflow.stages.len());
        for stage in &workflow.stages {
            let mut deps = Vec::new();
            for dep in &stage.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    Error::invalid_workflow(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    ))
                })?;
                if !deps.contains(&d) {
                    deps.push(d);
                }
            }
            if let Some(condition) = &stage.condition {
                Expression::parse(condition.expression()).map_err(|e| {
                    Error::invalid_workflow(format!("stage '{}': {}", stage.name, e))
                })?;
            }
            dependencies.push(deps);
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let n = workflow.stages.len();
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != n {
            let cyclic: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| workflow.stages[i].name.as_str())
                .collect();
            return Err(Error::invalid_workflow(format!(
                "cycle detected among stages: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self {
            names: workflow.stages.iter().map(|s| s.name.clone()).collect(),
            dependencies,
            order,
        })
    }

    /// Stage indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Stage names in execution order.
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    pub fn dependencies(&self, stage: usize) -> &[usize] {
        &self.dependencies[stage]
    }

    pub fn name(&self, stage: usize) -> &str {
        &self.names[stage]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Pending stages whose dependencies have all reached a terminal state,
    /// in plan order. `statuses` is indexed by declaration order.
    pub fn ready(&self, statuses: &[StageStatus]) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|&i| statuses[i] == StageStatus::Pending)
            .filter(|&i| self.dependencies[i].iter().all(|&d| statuses[d].is_terminal()))
            .collect()
    }
}
