//! Shell execution tool.
//!
//! Commands run through `sh -c` with the sandbox root as working directory,
//! a hard timeout, captured and truncated output, and a blocklist of
//! destructive patterns. A command that runs out of time is killed and
//! reported as `ToolError::Timeout`, never as a non-zero exit code.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::tools::builtin::file::resolve_in_sandbox;
use crate::tools::tool::{ExecutionContext, Tool, ToolError, ToolOutput, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Slack between the command timeout and the registry's outer timeout.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:",
        "dd if=/dev/zero",
        "mkfs",
        "chmod -r 777 /",
        "> /dev/sda",
        "curl | sh",
        "wget | sh",
        "curl | bash",
        "wget | bash",
    ])
});

static DANGEROUS_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "sudo ",
        "doas ",
        " | sh",
        " | bash",
        " | zsh",
        "eval ",
        "$(curl",
        "$(wget",
        "/etc/passwd",
        "/etc/shadow",
        "~/.ssh",
        "id_rsa",
    ]
});

/// Shell command execution tool confined to the sandbox root.
#[derive(Debug, Clone)]
pub struct ShellTool {
    root: PathBuf,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    fn is_blocked(cmd: &str) -> Option<&'static str> {
        let normalized = cmd.to_lowercase();

        if BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b)) {
            return Some("command contains blocked pattern");
        }
        if DANGEROUS_PATTERNS.iter().any(|p| normalized.contains(p)) {
            return Some("command contains potentially dangerous pattern");
        }
        None
    }

    async fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<(String, i32), ToolError> {
        let child = Command::new("sh")
            .args(["-c", cmd])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn command: {e}")))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!(
                    "command execution failed: {e}"
                )));
            }
            Err(_) => return Err(ToolError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        Ok((truncate_output(&combined), output.status.code().unwrap_or(-1)))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the workspace. Use for builds, tests, git and other \
         CLI tasks. Output is captured; commands that exceed the timeout are killed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory relative to the workspace root (optional)"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (optional, capped at the configured limit)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = require_str(&params, "command")?;

        if let Some(reason) = Self::is_blocked(command) {
            return Err(ToolError::NotAuthorized(format!(
                "{reason}: {}",
                truncate_for_error(command)
            )));
        }

        let cwd = match params.get("workdir").and_then(|v| v.as_str()) {
            Some(dir) => resolve_in_sandbox(dir, &self.root)?,
            None => self.root.clone(),
        };
        let timeout = params
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(|secs| Duration::from_secs(secs).min(self.timeout))
            .unwrap_or(self.timeout);

        let start = Instant::now();
        let (output, exit_code) = self.run(command, &cwd, timeout).await?;
        let duration = start.elapsed();

        tracing::info!(
            job_id = %ctx.job_id,
            command = %truncate_for_error(command),
            exit_code,
            elapsed_ms = duration.as_millis() as u64,
            "shell"
        );

        Ok(ToolOutput::success(
            serde_json::json!({
                "output": output,
                "exit_code": exit_code,
                "success": exit_code == 0,
            }),
            duration,
        ))
    }

    fn execution_timeout(&self) -> Duration {
        self.timeout.saturating_add(TIMEOUT_SLACK)
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail_start..]
    )
}

/// Largest byte index <= `i` that is a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}
