//! Agent Jobs: a persistent job queue whose worker loop drives
//! LLM-guided, tool-using agents one turn at a time.

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod store;
pub mod tools;
pub mod worker;
