//! Tool registry for managing available tools.
//!
//! The registry is an explicit value handed to the executor; there is no
//! process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ToolExecutionError;
use crate::llm::ToolDefinition;
use crate::tools::tool::{ExecutionContext, Tool, ToolError, ToolOutput};
use crate::tools::validation::validate_arguments;

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.write().await.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replaced previously registered tool");
        } else {
            tracing::debug!(tool = %name, "Registered tool");
        }
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// List all tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the model, sorted by name so prompts are stable.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve, validate and run one tool call under the tool's timeout.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| ToolExecutionError::NotFound {
                name: name.to_string(),
            })?;

        let params = validate_arguments(&tool.parameters_schema(), arguments).map_err(|reason| {
            ToolExecutionError::InvalidParameters {
                name: name.to_string(),
                reason,
            }
        })?;

        let timeout = tool.execution_timeout();
        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(named(name, e)),
            Err(_) => Err(ToolExecutionError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn named(name: &str, err: ToolError) -> ToolExecutionError {
    let name = name.to_string();
    match err {
        ToolError::InvalidParameters(reason) => {
            ToolExecutionError::InvalidParameters { name, reason }
        }
        ToolError::ExecutionFailed(reason) => ToolExecutionError::ExecutionFailed { name, reason },
        ToolError::NotAuthorized(reason) => ToolExecutionError::NotAuthorized { name, reason },
        ToolError::Timeout(timeout) => ToolExecutionError::Timeout { name, timeout },
    }
}
