//! In-memory store implementing every repository port.
//!
//! All state sits behind one mutex, so each `mark_job_as_*` call is a single
//! critical section and concurrent claims of the same job cannot both win.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{JobError, QueueError, Result};
use crate::jobs::{Job, JobStatus, Queue};
use crate::store::traits::{
    Annotation, AnnotationStore, AuditLog, AuditRecord, JobRepository, QueueRepository,
};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    queues: HashMap<Uuid, Queue>,
    annotations: Vec<Annotation>,
    audit: Vec<AuditRecord>,
}

impl State {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound { id }.into())
    }
}

/// Process-local store; contents are lost when it is dropped.
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` to decide when delayed jobs become due.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Apply `f` to a stored job and return the updated copy.
    ///
    /// On error the stored job is left untouched.
    async fn update<F>(&self, id: Uuid, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), JobError> + Send,
    {
        let mut state = self.state.lock().await;
        let stored = state.job_mut(id)?;
        let mut job = stored.clone();
        f(&mut job)?;
        *stored = job.clone();
        Ok(job)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn add(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get(&job.queue_id)
            .ok_or_else(|| QueueError::NotFound(job.queue_id.to_string()))?;
        if !queue.status.accepts_jobs() {
            return Err(QueueError::NotAcceptingJobs {
                name: queue.name.clone(),
                status: queue.status.to_string(),
            }
            .into());
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.job_mut(job.id)?;
        stored.data = job.data.clone();
        stored.name = job.name.clone();
        stored.progress = job.progress;
        Ok(())
    }

    async fn get_next_job(&self, queue_id: Uuid) -> Result<Option<Job>> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let next = state
            .jobs
            .values()
            .filter(|job| job.queue_id == queue_id && job.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .cloned();
        Ok(next)
    }

    async fn mark_job_as_started(&self, id: Uuid) -> Result<Job> {
        let now = self.clock.now();
        self.update(id, |job| {
            if job.status == JobStatus::Delayed {
                if !job.is_eligible(now) {
                    return Err(JobError::InvalidStatusTransition {
                        id: job.id,
                        from: job.status,
                        to: JobStatus::Active,
                    });
                }
                job.promote()?;
            }
            job.start()
        })
        .await
    }

    async fn mark_job_as_completed(
        &self,
        id: Uuid,
        output: Option<serde_json::Value>,
    ) -> Result<Job> {
        self.update(id, |job| job.complete(output)).await
    }

    async fn mark_job_as_failed(&self, id: Uuid, reason: &str) -> Result<Job> {
        self.update(id, |job| job.fail(reason)).await
    }

    async fn mark_job_as_delayed(
        &self,
        id: Uuid,
        execute_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<Job> {
        let backoff = (execute_after - self.clock.now())
            .to_std()
            .unwrap_or_default();
        self.update(id, |job| job.delay(execute_after, backoff, reason))
            .await
    }

    async fn mark_job_as_waiting(&self, id: Uuid) -> Result<Job> {
        self.update(id, |job| job.requeue()).await
    }

    async fn requeue_orphaned_jobs(&self, queue_id: Uuid) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for job in state.jobs.values_mut() {
            if job.queue_id == queue_id && job.status == JobStatus::Active {
                job.requeue()?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_by_status(&self, queue_id: Uuid) -> Result<HashMap<JobStatus, usize>> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for job in state.jobs.values().filter(|j| j.queue_id == queue_id) {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl QueueRepository for InMemoryStore {
    async fn find_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        let state = self.state.lock().await;
        Ok(state.queues.values().find(|q| q.name == name).cloned())
    }

    async fn find_queue_by_id(&self, id: Uuid) -> Result<Option<Queue>> {
        Ok(self.state.lock().await.queues.get(&id).cloned())
    }

    async fn create_queue(&self, name: &str) -> Result<Queue> {
        let queue = Queue::new(name)?;
        let mut state = self.state.lock().await;
        if state.queues.values().any(|q| q.name == queue.name) {
            return Err(QueueError::DuplicateName(queue.name).into());
        }
        state.queues.insert(queue.id, queue.clone());
        Ok(queue)
    }

    async fn save_queue(&self, queue: &Queue) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .queues
            .values()
            .any(|q| q.name == queue.name && q.id != queue.id)
        {
            return Err(QueueError::DuplicateName(queue.name.clone()).into());
        }
        state.queues.insert(queue.id, queue.clone());
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        let state = self.state.lock().await;
        let mut queues: Vec<Queue> = state.queues.values().cloned().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn delete_queue(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.queues.remove(&id).is_some();
        if existed {
            state.jobs.retain(|_, job| job.queue_id != id);
        }
        Ok(existed)
    }
}

#[async_trait]
impl AnnotationStore for InMemoryStore {
    async fn record(&self, annotation: Annotation) -> Result<()> {
        self.state.lock().await.annotations.push(annotation);
        Ok(())
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Vec<Annotation>> {
        let state = self.state.lock().await;
        Ok(state
            .annotations
            .iter()
            .filter(|a| a.has_tag(tag))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditLog for InMemoryStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        self.state.lock().await.audit.extend_from_slice(records);
        Ok(())
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<AuditRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }
}
