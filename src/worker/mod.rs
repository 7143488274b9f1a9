//! Job execution: the processor port and the polling worker loop.

pub mod processor;
pub mod worker_loop;

pub use processor::{ProcessingOutcome, ProcessingStatus, Processor};
pub use worker_loop::{TickOutcome, WorkerLoop};
