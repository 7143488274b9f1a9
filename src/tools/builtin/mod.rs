//! Built-in tools: sandboxed file access, shell execution and annotations.

pub mod annotate;
pub mod file;
pub mod shell;

use std::sync::Arc;

pub use annotate::AnnotateTool;
pub use file::{ListDirTool, ReadFileTool, WriteFileTool};
pub use shell::ShellTool;

use crate::config::SandboxConfig;
use crate::store::AnnotationStore;
use crate::tools::ToolRegistry;

/// Register every built-in tool. `annotate` is only added when a store is given.
pub async fn register_builtin_tools(
    registry: &ToolRegistry,
    sandbox: &SandboxConfig,
    annotations: Option<Arc<dyn AnnotationStore>>,
) {
    registry.register(Arc::new(ReadFileTool::new(&sandbox.root))).await;
    registry.register(Arc::new(WriteFileTool::new(&sandbox.root))).await;
    registry.register(Arc::new(ListDirTool::new(&sandbox.root))).await;
    registry
        .register(Arc::new(ShellTool::new(&sandbox.root, sandbox.shell_timeout)))
        .await;
    if let Some(store) = annotations {
        registry.register(Arc::new(AnnotateTool::new(store))).await;
    }
}
