use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::permission::PrivilegedOperation;
use super::sandbox::SandboxId;

// =============================================================================
// Agent Contract Types
// =============================================================================

/// Input handed to an agent for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub project_id: String,
    pub run_id: String,
    pub stage_name: String,
    /// Stage parameters from the workflow definition.
    pub parameters: HashMap<String, Value>,
    /// Snapshot of the run context (previous stage outputs, run parameters).
    pub context: HashMap<String, Value>,
    /// Sandbox the agent's tool calls execute in.
    pub sandbox_id: Option<SandboxId>,
}

/// A tool call requested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolInvocation {
    /// Run a command inside the stage's sandbox.
    Execute {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// Privileged operations the agent declares up front.
        #[serde(default)]
        declared: Vec<PrivilegedOperation>,
    },
    /// Any other tool; not interpreted by the engine.
    Other { name: String, args: Value },
}

impl ToolInvocation {
    pub fn execute(command: impl Into<String>) -> Self {
        Self::Execute {
            command: command.into(),
            timeout_secs: None,
            declared: Vec::new(),
        }
    }
}

/// Token usage reported by a provider call made by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsageRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
        }
    }
}

/// What an agent returns for one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Identifier of the agent instance that produced this response.
    pub agent_id: String,
    /// Free-form output.
    pub output: String,
    /// Structured outputs merged into the stage result.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(default)]
    pub usage: Vec<TokenUsageRecord>,
}

impl AgentResponse {
    pub fn text(agent_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, invocation: ToolInvocation) -> Self {
        self.tool_invocations.push(invocation);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsageRecord) -> Self {
        self.usage.push(usage);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}
