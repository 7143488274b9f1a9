//! The `Tool` trait and the values passed in and out of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default limit for a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Who is invoking a tool, and for which job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub job_id: Uuid,
}

impl ExecutionContext {
    pub fn new(agent_id: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            agent_id: agent_id.into(),
            job_id,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new("test-agent", Uuid::nil())
    }
}

/// Output of a successful tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Errors a tool raises about its own invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A capability the agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Upper bound enforced by the caller around `execute`.
    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// Fetch a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{key}' parameter")))
}
