//! Completion service integration.
//!
//! - `provider`: the `LlmProvider` port and chat message types
//! - `decision`: turns a completion into one `AgentDecision`
//! - `openai`: HTTP client for OpenAI-compatible endpoints

pub mod decision;
pub mod openai;
pub mod provider;

pub use decision::{AgentDecision, StructuredReply, decision_response_schema};
pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::ConfigError;

/// Create the configured provider, or the configuration error explaining why not.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    Ok(Arc::new(OpenAiProvider::new(config)?))
}
