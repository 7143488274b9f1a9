//! The agent executor and its parts.
//!
//! - `persona`: who the agent acts as
//! - `state`: versioned per-job conversation and audit state
//! - `prompts`: prompt text
//! - `compaction`: bounded conversation history
//! - `executor`: the multi-turn `Processor`

pub mod compaction;
pub mod executor;
pub mod persona;
pub mod prompts;
pub mod state;

pub use compaction::{HistoryCompactor, needs_compaction};
pub use executor::{AgentDeps, AgentExecutor, CLARIFICATION_TAG};
pub use persona::Persona;
pub use state::{AgentJobState, ExecutionEntry, ExecutionKind, STATE_SCHEMA_VERSION};
