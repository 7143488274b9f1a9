//! The processor port: one bounded unit of work per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobs::Job;

/// What the worker loop should do with a job after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Completed,
    Failed,
    /// Progress was made but the job isn't done; run it again on the next tick.
    ContinueProcessing,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ContinueProcessing => "continue_processing",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub status: ProcessingStatus,
    pub message: String,
    pub output: Option<serde_json::Value>,
}

impl ProcessingOutcome {
    pub fn completed(message: impl Into<String>, output: Option<serde_json::Value>) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            message: message.into(),
            output,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            message: message.into(),
            output: None,
        }
    }

    pub fn continue_processing(message: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::ContinueProcessing,
            message: message.into(),
            output: None,
        }
    }
}

/// Anything that can advance a job by one turn.
///
/// Implementations may mutate `job.data` (and progress); the worker loop
/// persists it after every call, whatever the outcome. Calling `process`
/// again for the same job must not re-run side effects already recorded in
/// `job.data`.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &mut Job) -> Result<ProcessingOutcome>;
}
