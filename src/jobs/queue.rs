//! Queues group jobs and gate whether workers pull from them.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Accepts new jobs; workers pull.
    Active,
    /// Accepts new jobs; workers do not pull.
    Paused,
    /// Rejects new jobs; workers keep pulling until empty.
    Draining,
}

impl QueueStatus {
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    pub fn is_pullable(&self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Draining => "draining",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "draining" => Ok(Self::Draining),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// A named job container.
///
/// Status changes return a new value; the original is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(QueueError::EmptyName);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            status: QueueStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn activate(&self) -> Self {
        self.with_status(QueueStatus::Active)
    }

    pub fn pause(&self) -> Self {
        self.with_status(QueueStatus::Paused)
    }

    pub fn drain(&self) -> Self {
        self.with_status(QueueStatus::Draining)
    }

    fn with_status(&self, status: QueueStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now().max(self.updated_at),
            ..self.clone()
        }
    }
}
