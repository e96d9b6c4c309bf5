//! External process execution with stderr capture.

use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Captured output of a successful tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: f64,
}

/// Run `command` to completion.
///
/// A non-zero exit becomes [`Error::Tool`] carrying the captured stderr.
/// `cancel` is only checked before spawning. Once started, the child runs
/// until it exits and callers observe cancellation at their next stage
/// boundary.
pub async fn run_tool(
    tool: &str,
    command: &mut Command,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    if cancel.is_cancelled() {
        debug!(tool, "Cancelled before spawning");
        return Err(Error::Cancelled);
    }

    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = command
        .output()
        .await
        .map_err(|e| Error::tool(tool, None, format!("failed to run: {e}")))?;

    let duration = start.elapsed().as_secs_f64();
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let tail = tail_lines(&stderr, 20);
        warn!(tool, code = ?output.status.code(), stderr = %tail, "Tool exited with failure");
        return Err(Error::tool(tool, output.status.code(), tail));
    }

    debug!(tool, duration, "Tool finished");
    Ok(ToolOutput {
        stdout,
        stderr,
        duration,
    })
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
