//! Persistence layer: repository ports plus in-memory and libSQL implementations.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::InMemoryStore;
pub use traits::{
    Annotation, AnnotationStore, AuditLog, AuditRecord, JobRepository, QueueRepository,
};
