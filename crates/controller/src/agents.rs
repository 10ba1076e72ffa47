//! Built-in agents.

use async_trait::async_trait;
use serde_json::Value;

use sandflow_core::{Agent, AgentRequest, AgentResponse, Error, Result, ToolInvocation};

/// Runs a stage's `command` (string) or `commands` (list) parameter in the
/// stage sandbox, one `Execute` invocation per command.
///
/// An optional `timeout_secs` parameter applies to every command.
pub struct ShellAgent {
    agent_type: String,
}

impl ShellAgent {
    pub fn new() -> Self {
        Self::with_type("shell")
    }

    /// Serve stages whose `agent_type` is `agent_type`.
    pub fn with_type(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
        }
    }
}

impl Default for ShellAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ShellAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        let mut commands = Vec::new();
        if let Some(command) = request.parameters.get("command") {
            match command {
                Value::String(c) => commands.push(c.clone()),
                other => {
                    return Err(Error::agent(format!(
                        "stage '{}': 'command' must be a string, got {}",
                        request.stage_name, other
                    )))
                }
            }
        }
        if let Some(list) = request.parameters.get("commands") {
            let Some(items) = list.as_array() else {
                return Err(Error::agent(format!(
                    "stage '{}': 'commands' must be a list",
                    request.stage_name
                )));
            };
            for item in items {
                let Some(c) = item.as_str() else {
                    return Err(Error::agent(format!(
                        "stage '{}': every entry of 'commands' must be a string",
                        request.stage_name
                    )));
                };
                commands.push(c.to_string());
            }
        }
        if commands.is_empty() {
            return Err(Error::agent(format!(
                "stage '{}' has no 'command' or 'commands' parameter",
                request.stage_name
            )));
        }

        let timeout_secs = request.parameters.get("timeout_secs").and_then(Value::as_u64);
        let mut response = AgentResponse::text(
            format!("{}:{}", self.agent_type, request.stage_name),
            format!("{} command(s)", commands.len()),
        );
        for command in commands {
            response = response.with_tool(ToolInvocation::Execute {
                command,
                timeout_secs,
                declared: Vec::new(),
            });
        }
        Ok(response)
    }
}
