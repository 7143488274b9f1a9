//! Job and queue domain model.
//!
//! - `status`: job status state machine (Waiting → Active → Completed/Failed/Delayed)
//! - `job`: the job entity and its transition methods
//! - `queue`: named queues with active/paused/draining status
//! - `retry`: exponential backoff policy

pub mod job;
pub mod queue;
pub mod retry;
pub mod status;

pub use job::{DEFAULT_MAX_ATTEMPTS, Job, MAX_PRIORITY, MIN_PRIORITY};
pub use queue::{Queue, QueueStatus};
pub use retry::{RetryDecision, RetryPolicy};
pub use status::JobStatus;
