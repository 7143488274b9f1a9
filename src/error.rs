//! Error types for the job engine.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::JobStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolExecutionError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl Error {
    /// Domain-level rejections that must never be retried by the worker loop.
    pub fn is_domain_rejection(&self) -> bool {
        matches!(
            self,
            Error::Job(JobError::InvalidStatusTransition { .. })
                | Error::Job(JobError::InvalidPriority { .. })
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Completion service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Generation error from {provider}: {reason}")]
    Generation { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A failed tool invocation, carrying the tool name and the original cause.
#[derive(Debug, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} refused: {reason}")]
    NotAuthorized { name: String, reason: String },
}

impl ToolExecutionError {
    /// Name of the tool that raised the error.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::NotFound { name }
            | Self::ExecutionFailed { name, .. }
            | Self::Timeout { name, .. }
            | Self::InvalidParameters { name, .. }
            | Self::NotAuthorized { name, .. } => name,
        }
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidStatusTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Priority {value} is out of range (0..=10)")]
    InvalidPriority { value: i64 },

    #[error("Job {id} has an invalid payload: {reason}")]
    InvalidPayload { id: Uuid, reason: String },
}

/// Queue-related errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {0} not found")]
    NotFound(String),

    #[error("Queue name {0} is already taken")]
    DuplicateName(String),

    #[error("Queue name must not be empty")]
    EmptyName,

    #[error("Queue {name} is {status} and does not accept new jobs")]
    NotAcceptingJobs { name: String, status: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
