//! The job entity.
//!
//! Status, attempts and timestamps can only change through the transition
//! methods below, each of which consults [`JobStatus::can_transition_to`].
//! A rejected transition leaves the job untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::status::JobStatus;

pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Owning queue. Queue lifecycle is independent of the job.
    pub queue_id: Uuid,
    pub name: String,
    pub(crate) status: JobStatus,
    pub(crate) priority: u8,
    /// Task input, fixed at creation.
    pub(crate) payload: serde_json::Value,
    /// Processor-owned scratch state carried between turns.
    pub data: serde_json::Value,
    pub(crate) result: Option<serde_json::Value>,
    pub(crate) failed_reason: Option<String>,
    pub(crate) progress: u8,
    pub(crate) attempts: u32,
    pub max_attempts: u32,
    /// Backoff applied by the most recent retry, in milliseconds.
    pub(crate) delay_ms: u64,
    /// Per-job override for the retry base delay (0 uses the worker's policy).
    pub retry_delay_ms: u64,
    pub(crate) execute_after: Option<DateTime<Utc>>,
    /// Advisory only; the scheduler does not enforce ordering between jobs.
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) processed_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new `Waiting` job with empty processor data.
    pub fn new(queue_id: Uuid, name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue_id,
            name: name.into(),
            status: JobStatus::Waiting,
            priority: 0,
            payload,
            data: serde_json::Value::Null,
            result: None,
            failed_reason: None,
            progress: 0,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: 0,
            retry_delay_ms: 0,
            execute_after: None,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Result<Self, JobError> {
        self.set_priority(priority)?;
        Ok(self)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn with_depends_on(mut self, ids: Vec<Uuid>) -> Self {
        self.depends_on = ids;
        self
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.failed_reason.as_deref()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn execute_after(&self) -> Option<DateTime<Utc>> {
        self.execute_after
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.execute_after.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Set the priority. Values outside `0..=10` are rejected and leave the job unchanged.
    pub fn set_priority(&mut self, priority: i64) -> Result<(), JobError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(JobError::InvalidPriority { value: priority });
        }
        self.priority = priority as u8;
        Ok(())
    }

    /// Record progress, clamped to 100.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// `Waiting -> Active`.
    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::Active)?;
        self.execute_after = None;
        self.processed_at = Some(self.updated_at);
        Ok(())
    }

    /// `Active -> Completed`.
    pub fn complete(&mut self, result: Option<serde_json::Value>) -> Result<(), JobError> {
        self.transition(JobStatus::Completed)?;
        self.result = result;
        self.progress = 100;
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// `Active -> Failed`. Consumes the final attempt.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.attempts += 1;
        self.failed_reason = Some(reason.into());
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// `Active -> Delayed`. Consumes an attempt and gates the job until `execute_after`.
    pub fn delay(
        &mut self,
        execute_after: DateTime<Utc>,
        backoff: std::time::Duration,
        reason: impl Into<String>,
    ) -> Result<(), JobError> {
        self.transition(JobStatus::Delayed)?;
        self.attempts += 1;
        self.delay_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        self.execute_after = Some(execute_after);
        self.failed_reason = Some(reason.into());
        Ok(())
    }

    /// `Active -> Waiting`. Returns the job to the pool without consuming an attempt.
    pub fn requeue(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::Waiting)
    }

    /// `Delayed -> Waiting`.
    pub fn promote(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::Waiting)?;
        self.execute_after = None;
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidStatusTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now().max(self.updated_at);
        Ok(())
    }
}
