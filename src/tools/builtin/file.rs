//! Sandboxed file tools: read, write and list under one root directory.
//!
//! Every path is resolved against the sandbox root and rejected with
//! `NotAuthorized` if it would land outside it, including through `..`
//! segments, absolute paths or symlinked ancestors.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;

use crate::tools::tool::{ExecutionContext, Tool, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Resolve `.` and `..` without touching the filesystem.
///
/// `canonicalize` only works on paths that exist, and new files don't.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the nearest existing ancestor of `path` and re-append the rest.
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let mut result = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolve `path_str` under `root`, refusing anything that escapes it.
pub(crate) fn resolve_in_sandbox(path_str: &str, root: &Path) -> Result<PathBuf, ToolError> {
    let path = PathBuf::from(path_str);
    let joined = if path.is_absolute() {
        path
    } else {
        root.join(path)
    };
    let resolved = normalize_lexical(&joined);

    let root_canonical = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(root));

    if !canonical_prefix(&resolved).starts_with(&root_canonical) {
        return Err(ToolError::NotAuthorized(format!(
            "path escapes sandbox: {path_str}"
        )));
    }

    Ok(resolved)
}

/// Model-supplied counts can be any `u64`; clamp instead of wrapping.
fn saturating_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn display_relative(path: &Path, root: &Path) -> String {
    let root = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(root));
    let path = canonical_prefix(path);
    match path.strip_prefix(&root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

// ── ReadFileTool ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns line-numbered content. \
         For large files, use offset and limit to read a portion."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = require_str(&params, "path")?;
        let offset = params
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(saturating_usize)
            .unwrap_or(0);
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(saturating_usize);

        let start = Instant::now();
        let path = resolve_in_sandbox(path_str, &self.root)?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot access {path_str}: {e}")))?;

        if metadata.len() > MAX_READ_SIZE {
            return Err(ToolError::ExecutionFailed(format!(
                "file too large ({} bytes, maximum {MAX_READ_SIZE})",
                metadata.len()
            )));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read {path_str}: {e}")))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = offset.saturating_sub(1).min(total_lines);
        let end_line = match limit {
            Some(lim) => start_line.saturating_add(lim).min(total_lines),
            None => total_lines,
        };

        let selected: Vec<String> = lines[start_line..end_line]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}│ {}", start_line + i + 1, line))
            .collect();

        tracing::debug!(job_id = %ctx.job_id, path = %path_str, "read_file");

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": display_relative(&path, &self.root),
                "content": selected.join("\n"),
                "total_lines": total_lines,
                "lines_shown": end_line - start_line,
            }),
            start.elapsed(),
        ))
    }
}

// ── WriteFileTool ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace. Creates the file if it doesn't exist, \
         overwrites it if it does. Parent directories are created automatically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                },
                "mode": {
                    "type": "string",
                    "enum": ["overwrite", "append"],
                    "description": "Overwrite (default) or append to an existing file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;
        let append = params.get("mode").and_then(|v| v.as_str()) == Some("append");

        let start = Instant::now();

        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "content too large ({} bytes, maximum {MAX_WRITE_SIZE})",
                content.len()
            )));
        }

        let path = resolve_in_sandbox(path_str, &self.root)?;
        if path.is_dir() {
            return Err(ToolError::InvalidParameters(format!(
                "{path_str} is a directory"
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("failed to create directories: {e}"))
            })?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to open {path_str}: {e}")))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {path_str}: {e}")))?;
        } else {
            fs::write(&path, content)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {path_str}: {e}")))?;
        }

        tracing::info!(
            job_id = %ctx.job_id,
            path = %path_str,
            bytes = content.len(),
            append,
            "write_file"
        );

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": display_relative(&path, &self.root),
                "bytes_written": content.len(),
                "success": true
            }),
            start.elapsed(),
        ))
    }
}

// ── ListDirTool ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List contents of a workspace directory. Shows files and subdirectories with sizes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the workspace root (default \".\")"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "If true, list contents recursively (default false)"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth for recursive listing (default 3)"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let path_str = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let recursive = params
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let max_depth = params
            .get("max_depth")
            .and_then(|v| v.as_u64())
            .map(saturating_usize)
            .unwrap_or(3);

        let start = Instant::now();
        let path = resolve_in_sandbox(path_str, &self.root)?;

        let mut entries = Vec::new();
        list_dir_inner(&path, &path, recursive, max_depth, 0, &mut entries).await?;

        entries.sort_by(|a, b| match (a.ends_with('/'), b.ends_with('/')) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.cmp(b),
        });

        let truncated = entries.len() >= MAX_DIR_ENTRIES;

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": display_relative(&path, &self.root),
                "count": entries.len(),
                "entries": entries,
                "truncated": truncated
            }),
            start.elapsed(),
        ))
    }
}

async fn list_dir_inner(
    base: &Path,
    path: &Path,
    recursive: bool,
    max_depth: usize,
    current_depth: usize,
    entries: &mut Vec<String>,
) -> Result<(), ToolError> {
    if entries.len() >= MAX_DIR_ENTRIES {
        return Ok(());
    }

    let mut dir = fs::read_dir(path)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read directory: {e}")))?;

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read entry: {e}")))?
    {
        if entries.len() >= MAX_DIR_ENTRIES {
            break;
        }

        let entry_path = entry.path();
        let relative = entry_path
            .strip_prefix(base)
            .unwrap_or(&entry_path)
            .to_string_lossy()
            .into_owned();

        let metadata = entry.metadata().await.ok();
        let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());

        if is_dir {
            entries.push(format!("{relative}/"));
        } else {
            let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
            entries.push(format!("{relative} ({})", format_size(size)));
        }

        if recursive && is_dir && current_depth < max_depth {
            let name = entry.file_name();
            if !matches!(name.to_string_lossy().as_ref(), "target" | ".git" | "node_modules") {
                Box::pin(list_dir_inner(
                    base,
                    &entry_path,
                    recursive,
                    max_depth,
                    current_depth + 1,
                    entries,
                ))
                .await?;
            }
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_file_with_offset_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("test.txt"), "a\nb\nc\nd\ne\n").unwrap();

        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute(
                serde_json::json!({"path": "test.txt", "offset": 2, "limit": 2}),
                &ExecutionContext::default(),
            )
            .await
            .unwrap();

        let content = result.result["content"].as_str().unwrap();
        assert!(content.contains("│ b"));
        assert!(content.contains("│ c"));
        assert!(!content.contains("│ a"));
        assert_eq!(result.result["lines_shown"], 2);
        assert_eq!(result.result["total_lines"], 5);
        assert_eq!(result.result["path"], "test.txt");
    }

    #[tokio::test]
    async fn test_read_file_huge_offset_and_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\n").unwrap();
        let tool = ReadFileTool::new(dir.path());
        let ctx = ExecutionContext::default();

        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "offset": 2, "limit": u64::MAX}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.result["lines_shown"], 2);
        assert!(result.result["content"].as_str().unwrap().contains("│ c"));

        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "offset": u64::MAX, "limit": u64::MAX}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.result["lines_shown"], 0);
    }

    #[tokio::test]
    async fn test_list_dir_huge_depth() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let tool = ListDirTool::new(dir.path());

        let result = tool
            .execute(
                serde_json::json!({"path": ".", "recursive": true, "max_depth": u64::MAX}),
                &ExecutionContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.result["count"], 2);
    }

    #[tokio::test]
    async fn test_write_file_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(dir.path());

        let result = tool
            .execute(
                serde_json::json!({"path": "a/b/deep.txt", "content": "deep"}),
                &ExecutionContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.result["success"], true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/deep.txt")).unwrap(),
            "deep"
        );
    }

    #[tokio::test]
    async fn test_write_file_append() {
        let dir = TempDir::new().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let ctx = ExecutionContext::default();

        tool.execute(serde_json::json!({"path": "log.txt", "content": "one\n"}), &ctx)
            .await
            .unwrap();
        tool.execute(
            serde_json::json!({"path": "log.txt", "content": "two\n", "mode": "append"}),
            &ctx,
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("log.txt")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn test_write_outside_sandbox_is_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let tool = WriteFileTool::new(&root);

        let err = tool
            .execute(
                serde_json::json!({"path": "../escape.txt", "content": "x"}),
                &ExecutionContext::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::NotAuthorized(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_list_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file1.txt"), "content").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let tool = ListDirTool::new(dir.path());
        let result = tool
            .execute(serde_json::json!({}), &ExecutionContext::default())
            .await
            .unwrap();

        let entries: Vec<&str> = result.result["entries"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e.as_str())
            .collect();
        assert_eq!(entries[0], "subdir/");
        assert!(entries.iter().any(|e| e.starts_with("file1.txt")));
    }

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(normalize_lexical(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_lexical(Path::new("/a/./b/./c")), PathBuf::from("/a/b/c"));
        assert_eq!(normalize_lexical(Path::new("/a/../../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_rejects_traversal_and_absolute() {
        let dir = TempDir::new().unwrap();
        assert!(resolve_in_sandbox("../../etc/passwd", dir.path()).is_err());
        assert!(resolve_in_sandbox("/etc/passwd", dir.path()).is_err());
        let evil = format!("{}/../outside/new/file.txt", dir.path().display());
        assert!(resolve_in_sandbox(&evil, dir.path()).is_err());
    }

    #[test]
    fn test_resolve_allows_nested_and_inner_dot_dot() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        assert!(resolve_in_sandbox("subdir/newfile.txt", dir.path()).is_ok());
        assert!(resolve_in_sandbox("a/b/../c.txt", dir.path()).is_ok());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(1024 * 1024), "1.0MB");
    }
}
