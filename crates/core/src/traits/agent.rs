//! Agent layer contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AgentRequest, AgentResponse};

/// An agent that executes one workflow stage.
///
/// Concrete LLM-backed agents live outside this workspace; the engine only
/// routes `Execute` tool invocations from the response to the sandbox.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent type this implementation serves (matched against `WorkflowStage::agent_type`).
    fn agent_type(&self) -> &str;

    /// Execute a stage.
    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse>;
}
