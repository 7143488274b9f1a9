//! Worker loop: polls one queue and drives jobs through a processor.
//!
//! Each tick claims at most one job: pick the next eligible job, guard it
//! in a local in-flight set, claim it in the repository, run one processor
//! turn, persist `job.data`, then reconcile the status from the outcome.
//! Failures are retried with exponential backoff until `max_attempts` is
//! used up. If the data or the status cannot be written, the job is failed
//! or delayed instead of being requeued with stale data; only when that
//! also fails does it stay `Active` for `requeue_orphaned_jobs` at startup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::error::{Error, QueueError, Result};
use crate::jobs::{Job, Queue, RetryDecision, RetryPolicy};
use crate::store::{JobRepository, QueueRepository};
use crate::worker::processor::{ProcessingOutcome, ProcessingStatus, Processor};

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing eligible, or the queue isn't being pulled.
    Idle,
    /// The next job was already being handled, or another worker claimed it first.
    Skipped(Uuid),
    Processed {
        job_id: Uuid,
        status: ProcessingStatus,
    },
}

/// Removes a job from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct WorkerLoop {
    queue_id: Uuid,
    queue_name: String,
    jobs: Arc<dyn JobRepository>,
    queues: Arc<dyn QueueRepository>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashSet<Uuid>>,
    running: AtomicBool,
    /// Bumped by every `start()`; runners from an older start exit.
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl WorkerLoop {
    pub fn new(
        queue: &Queue,
        jobs: Arc<dyn JobRepository>,
        queues: Arc<dyn QueueRepository>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue_id: queue.id,
            queue_name: queue.name.clone(),
            jobs,
            queues,
            processor,
            config,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Jobs currently being processed by this loop.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn `config.concurrency` runners. Returns no handles if already running.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.queue_name, "Worker loop already running");
            return Vec::new();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shutdown.send_replace(false);

        let runners = self.config.concurrency.max(1);
        info!(
            queue = %self.queue_name,
            runners,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker loop started"
        );

        (0..runners)
            .map(|runner| {
                let this = Arc::clone(self);
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(async move { this.run(runner, generation, shutdown).await })
            })
            .collect()
    }

    /// Ask the runners to stop after their current tick.
    ///
    /// An in-flight `process()` call is never interrupted.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(queue = %self.queue_name, "Worker loop stopping");
        }
        self.shutdown.send_replace(true);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run(&self, runner: usize, generation: u64, mut shutdown: watch::Receiver<bool>) {
        while self.is_current(generation) {
            let idle = match self.tick().await {
                Ok(TickOutcome::Processed { .. }) => false,
                Ok(_) => true,
                Err(e) => {
                    error!(queue = %self.queue_name, runner, error = %e, "Worker tick failed");
                    true
                }
            };

            if idle && self.is_current(generation) {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        debug!(queue = %self.queue_name, runner, "Worker runner exited");
    }

    /// Run one poll: claim at most one job and process one turn of it.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let queue = self
            .queues
            .find_queue_by_id(self.queue_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(self.queue_name.clone()))?;
        if !queue.status.is_pullable() {
            return Ok(TickOutcome::Idle);
        }

        let Some(candidate) = self.jobs.get_next_job(self.queue_id).await? else {
            return Ok(TickOutcome::Idle);
        };
        let job_id = candidate.id;

        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id)
        {
            debug!(job_id = %job_id, "Job already in flight, skipping");
            return Ok(TickOutcome::Skipped(job_id));
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            id: job_id,
        };

        let mut job = match self.jobs.mark_job_as_started(job_id).await {
            Ok(job) => job,
            Err(e) if e.is_domain_rejection() => {
                debug!(job_id = %job_id, error = %e, "Lost claim race, skipping");
                return Ok(TickOutcome::Skipped(job_id));
            }
            Err(e) => return Err(e),
        };

        info!(
            job_id = %job_id,
            queue = %self.queue_name,
            name = %job.name,
            attempt = job.attempts() + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let started = Instant::now();
        let outcome = self.processor.process(&mut job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let settled = match self.jobs.save(&job).await {
            Ok(()) => self.settle(&job, outcome, elapsed_ms).await,
            Err(e) => {
                // Never requeue with stale data.
                error!(job_id = %job_id, error = %e, "Failed to persist job data");
                self.retry_or_fail(&job, &format!("failed to persist job data: {e}"))
                    .await
                    .map(|()| ProcessingStatus::Failed)
            }
        };

        match settled {
            Ok(status) => Ok(TickOutcome::Processed { job_id, status }),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                self.recover_unsettled(&job, &e).await?;
                Ok(TickOutcome::Processed {
                    job_id,
                    status: ProcessingStatus::Failed,
                })
            }
        }
    }

    /// Write the status that follows from one processor turn.
    async fn settle(
        &self,
        job: &Job,
        outcome: Result<ProcessingOutcome>,
        elapsed_ms: u64,
    ) -> Result<ProcessingStatus> {
        let job_id = job.id;
        match outcome {
            Ok(outcome) => match outcome.status {
                ProcessingStatus::Completed => {
                    self.jobs
                        .mark_job_as_completed(job_id, outcome.output)
                        .await?;
                    info!(job_id = %job_id, elapsed_ms, message = %outcome.message, "Job completed");
                    Ok(ProcessingStatus::Completed)
                }
                ProcessingStatus::ContinueProcessing => {
                    self.jobs.mark_job_as_waiting(job_id).await?;
                    debug!(job_id = %job_id, elapsed_ms, message = %outcome.message, "Job continues");
                    Ok(ProcessingStatus::ContinueProcessing)
                }
                ProcessingStatus::Failed => {
                    self.retry_or_fail(job, &outcome.message).await?;
                    Ok(ProcessingStatus::Failed)
                }
            },
            Err(e) if e.is_domain_rejection() => {
                error!(job_id = %job_id, elapsed_ms, error = %e, "Processor hit a domain rejection, not retrying");
                self.jobs.mark_job_as_failed(job_id, &e.to_string()).await?;
                Ok(ProcessingStatus::Failed)
            }
            Err(e) => {
                error!(job_id = %job_id, elapsed_ms, error = %e, "Processor raised");
                self.retry_or_fail(job, &e.to_string()).await?;
                Ok(ProcessingStatus::Failed)
            }
        }
    }

    /// Move a job whose status write failed out of `Active`.
    ///
    /// Tries the retry schedule, then a terminal failure. Errors only if
    /// neither write succeeds.
    async fn recover_unsettled(&self, job: &Job, cause: &Error) -> Result<()> {
        let reason = format!("failed to record outcome: {cause}");
        let err = match self.retry_or_fail(job, &reason).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if err.is_domain_rejection() {
            debug!(job_id = %job.id, error = %err, "Job already left active");
            return Ok(());
        }
        warn!(job_id = %job.id, error = %err, "Could not schedule retry, failing job");
        match self.jobs.mark_job_as_failed(job.id, &reason).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_domain_rejection() => Ok(()),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job left active until orphan recovery");
                Err(Error::Processing(reason))
            }
        }
    }

    async fn retry_or_fail(&self, job: &Job, reason: &str) -> Result<()> {
        let policy = self.retry.with_base_override(job.retry_delay_ms);
        match policy.decide(job.attempts(), job.max_attempts) {
            RetryDecision::Delay(backoff) => {
                let execute_after = self.clock.now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(30_000));
                let delayed = self
                    .jobs
                    .mark_job_as_delayed(job.id, execute_after, reason)
                    .await?;
                warn!(
                    job_id = %job.id,
                    attempts = delayed.attempts(),
                    max_attempts = delayed.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    reason,
                    "Job failed, retrying later"
                );
            }
            RetryDecision::GiveUp => {
                let failed = self.jobs.mark_job_as_failed(job.id, reason).await?;
                error!(
                    job_id = %job.id,
                    attempts = failed.attempts(),
                    reason,
                    "Job failed permanently"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::JobError;
    use crate::jobs::{JobStatus, QueueStatus};
    use crate::store::InMemoryStore;

    struct Scripted {
        outcomes: Mutex<Vec<ProcessingStatus>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<ProcessingStatus>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Processor for Scripted {
        async fn process(&self, job: &mut Job) -> Result<ProcessingOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            job.data = serde_json::json!({"turns": self.calls.load(Ordering::SeqCst)});
            let next = self.outcomes.lock().unwrap().pop();
            Ok(match next {
                Some(ProcessingStatus::Completed) | None => {
                    ProcessingOutcome::completed("done", Some(serde_json::json!("ok")))
                }
                Some(ProcessingStatus::Failed) => ProcessingOutcome::failed("boom"),
                Some(ProcessingStatus::ContinueProcessing) => {
                    ProcessingOutcome::continue_processing("more")
                }
            })
        }
    }

    /// Reports an illegal transition instead of an outcome.
    struct Rejects;

    #[async_trait]
    impl Processor for Rejects {
        async fn process(&self, job: &mut Job) -> Result<ProcessingOutcome> {
            Err(JobError::InvalidStatusTransition {
                id: job.id,
                from: JobStatus::Completed,
                to: JobStatus::Active,
            }
            .into())
        }
    }

    async fn setup(
        processor: Arc<dyn Processor>,
    ) -> (Arc<WorkerLoop>, Arc<InMemoryStore>, Queue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let queue = store.create_queue("q").await.unwrap();
        let worker = WorkerLoop::new(
            &queue,
            store.clone(),
            store.clone(),
            processor,
            WorkerConfig::default(),
        )
        .with_clock(clock.clone());
        (Arc::new(worker), store, queue, clock)
    }

    #[tokio::test]
    async fn idle_when_nothing_to_do() {
        let (worker, _, _, _) = setup(Arc::new(Scripted::new(vec![]))).await;
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn paused_queue_is_not_pulled() {
        let (worker, store, queue, _) = setup(Arc::new(Scripted::new(vec![]))).await;
        store.add(&Job::new(queue.id, "j", serde_json::json!({}))).await.unwrap();
        store.save_queue(&queue.pause()).await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);

        store.save_queue(&queue.drain()).await.unwrap();
        assert!(matches!(
            worker.tick().await.unwrap(),
            TickOutcome::Processed { .. }
        ));
        let q = store.find_queue_by_id(queue.id).await.unwrap().unwrap();
        assert_eq!(q.status, QueueStatus::Draining);
    }

    #[tokio::test]
    async fn completes_and_persists_data() {
        let (worker, store, queue, _) =
            setup(Arc::new(Scripted::new(vec![ProcessingStatus::Completed]))).await;
        let job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                job_id: job.id,
                status: ProcessingStatus::Completed
            }
        );
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.result(), Some(&serde_json::json!("ok")));
        assert_eq!(stored.data, serde_json::json!({"turns": 1}));
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn continue_requeues_without_consuming_attempts() {
        let (worker, store, queue, _) = setup(Arc::new(Scripted::new(vec![
            ProcessingStatus::ContinueProcessing,
            ProcessingStatus::ContinueProcessing,
            ProcessingStatus::Completed,
        ])))
        .await;
        let job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        for _ in 0..2 {
            worker.tick().await.unwrap();
            let stored = store.find_by_id(job.id).await.unwrap().unwrap();
            assert_eq!(stored.status(), JobStatus::Waiting);
            assert_eq!(stored.attempts(), 0);
        }
        worker.tick().await.unwrap();
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.data, serde_json::json!({"turns": 3}));
    }

    #[tokio::test]
    async fn in_flight_job_is_skipped() {
        let (worker, store, queue, _) = setup(Arc::new(Scripted::new(vec![]))).await;
        let job = Job::new(queue.id, "j", serde_json::json!({}));
        store.add(&job).await.unwrap();

        worker.in_flight.lock().unwrap().insert(job.id);
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Skipped(job.id));
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Waiting);
    }

    #[tokio::test]
    async fn domain_rejection_fails_without_retry() {
        let (worker, store, queue, clock) = setup(Arc::new(Rejects)).await;
        let job = Job::new(queue.id, "j", serde_json::json!({})).with_max_attempts(5);
        store.add(&job).await.unwrap();

        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Processed {
                job_id: job.id,
                status: ProcessingStatus::Failed
            }
        );
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.attempts(), 1);
        assert!(stored.failed_reason().unwrap().contains("cannot transition"));

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_ends_runners() {
        let (worker, _, _, _) = setup(Arc::new(Scripted::new(vec![]))).await;
        let handles = worker.start();
        assert_eq!(handles.len(), 1);
        assert!(worker.start().is_empty());
        assert!(worker.is_running());

        worker.stop();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!worker.is_running());
    }
}
