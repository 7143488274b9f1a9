//! Tool abstraction for agent capabilities.

pub mod builtin;
pub mod registry;
pub mod tool;
pub mod validation;

pub use registry::ToolRegistry;
pub use tool::*;
pub use validation::validate_arguments;
