//! Job status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for the next poll.
    Waiting,
    /// Claimed by a worker loop; a turn is running.
    Active,
    /// Finished successfully.
    Completed,
    /// Gave up after exhausting its attempts.
    Failed,
    /// Backing off until `execute_after`.
    Delayed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Active -> Waiting` is the continuation edge: a turn made progress and
    /// the job goes straight back to the pool without consuming an attempt.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Active, Waiting)
                | (Delayed, Waiting)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Delayed,
    ];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}
