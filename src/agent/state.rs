//! Versioned agent state stored in `job.data` between turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::Job;
use crate::llm::ChatMessage;
use crate::store::AuditRecord;

/// Current layout of [`AgentJobState`]. Bump when the shape changes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Kind of an execution-history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    SystemError,
    LlmEvent,
    LlmError,
    LlmWarning,
    ToolCall,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemError => "system_error",
            Self::LlmEvent => "llm_event",
            Self::LlmError => "llm_error",
            Self::LlmWarning => "llm_warning",
            Self::ToolCall => "tool_call",
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry. Appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ExecutionKind,
    /// Tool or event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionEntry {
    pub fn new(kind: ExecutionKind, detail: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            name: None,
            detail,
            error: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The persisted audit form of this entry.
    pub fn to_audit_record(&self, job_id: Uuid) -> AuditRecord {
        AuditRecord {
            job_id,
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            detail: self.detail.clone(),
            error: self.error.clone(),
            recorded_at: self.timestamp,
        }
    }
}

/// Everything the agent executor carries from one turn to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJobState {
    pub schema_version: u32,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionEntry>,
    /// Summary of the abandoned attempt, fed into the next seeded conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_summary: Option<String>,
}

impl Default for AgentJobState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            conversation_history: Vec::new(),
            execution_history: Vec::new(),
            last_failure_summary: None,
        }
    }
}

impl AgentJobState {
    /// Read the state out of `job.data`. A job that has never run has `null`
    /// data and gets an empty state.
    pub fn load(job: &Job) -> Result<Self, JobError> {
        if job.data.is_null() {
            return Ok(Self::default());
        }

        let state: Self =
            serde_json::from_value(job.data.clone()).map_err(|e| JobError::InvalidPayload {
                id: job.id,
                reason: format!("agent state is unreadable: {e}"),
            })?;

        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(JobError::InvalidPayload {
                id: job.id,
                reason: format!(
                    "agent state schema {} is newer than supported {}",
                    state.schema_version, STATE_SCHEMA_VERSION
                ),
            });
        }

        Ok(Self {
            schema_version: STATE_SCHEMA_VERSION,
            ..state
        })
    }

    /// Write the state into `job.data`, replacing whatever was there.
    pub fn store(&self, job: &mut Job) -> Result<(), JobError> {
        job.data = serde_json::to_value(self).map_err(|e| JobError::InvalidPayload {
            id: job.id,
            reason: format!("agent state could not be serialized: {e}"),
        })?;
        Ok(())
    }

    pub fn record(&mut self, entry: ExecutionEntry) {
        self.execution_history.push(entry);
    }
}
