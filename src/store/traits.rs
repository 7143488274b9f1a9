//! Repository ports for jobs, queues, annotations and the execution audit log.
//!
//! Status changes only happen through the `mark_job_as_*` operations, each of
//! which is atomic with respect to concurrent callers: the job's current
//! status is checked and replaced in one step, and a caller that loses the
//! race gets `JobError::InvalidStatusTransition` back.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{Job, JobStatus, Queue};

/// Persistence for jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Enqueue a new job. Fails if its queue is unknown or not accepting jobs.
    async fn add(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// Persist the processor-owned parts of a job: `data`, `progress` and `name`.
    ///
    /// Never changes status; use the `mark_job_as_*` operations for that.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Highest-priority eligible job in the queue, oldest first among equals.
    ///
    /// Eligible means `Waiting`, or `Delayed` with `execute_after` in the past.
    async fn get_next_job(&self, queue_id: Uuid) -> Result<Option<Job>>;

    /// Claim a job for processing. A due `Delayed` job is promoted first.
    async fn mark_job_as_started(&self, id: Uuid) -> Result<Job>;

    async fn mark_job_as_completed(
        &self,
        id: Uuid,
        output: Option<serde_json::Value>,
    ) -> Result<Job>;

    /// Terminal failure.
    async fn mark_job_as_failed(&self, id: Uuid, reason: &str) -> Result<Job>;

    /// Retry later; the job becomes eligible again at `execute_after`.
    async fn mark_job_as_delayed(
        &self,
        id: Uuid,
        execute_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<Job>;

    /// Return an active job to the pool without consuming an attempt.
    async fn mark_job_as_waiting(&self, id: Uuid) -> Result<Job>;

    /// Put jobs left `Active` by a previous process back to `Waiting`.
    async fn requeue_orphaned_jobs(&self, queue_id: Uuid) -> Result<usize>;

    async fn count_by_status(&self, queue_id: Uuid) -> Result<HashMap<JobStatus, usize>>;
}

/// Persistence for queues.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn find_queue_by_name(&self, name: &str) -> Result<Option<Queue>>;

    async fn find_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>>;

    /// Create an `Active` queue. Names are unique.
    async fn create_queue(&self, name: &str) -> Result<Queue>;

    async fn save_queue(&self, queue: &Queue) -> Result<()>;

    async fn list_queues(&self) -> Result<Vec<Queue>>;

    /// Remove a queue and its jobs. Returns whether it existed.
    async fn delete_queue(&self, id: Uuid) -> Result<bool>;
}

/// A tagged note recorded by the agent or a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub content: String,
    pub tags: Vec<String>,
    pub job_id: Option<Uuid>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn new(content: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            tags,
            job_id: None,
            agent_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn by_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn record(&self, annotation: Annotation) -> Result<()>;

    /// Annotations carrying `tag`, oldest first.
    async fn find_by_tag(&self, tag: &str) -> Result<Vec<Annotation>>;
}

/// One execution-history entry, persisted outside the job for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    pub kind: String,
    pub name: Option<String>,
    pub detail: serde_json::Value,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, records: &[AuditRecord]) -> Result<()>;

    /// All records for a job in the order they were appended.
    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<AuditRecord>>;
}
