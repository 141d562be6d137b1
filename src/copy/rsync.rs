//! Copy engine backed by the external rsync binary

use super::{CopyEngine, ProgressCallback};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Progress markers rsync prints after each transferred entry
const PROGRESS_MARKERS: &[&str] = &["to-chk=", "to-check=", "ir-chk="];

/// Copies with `rsync -aHAXr --progress`, preserving hard links, ACLs and xattrs
///
/// The copied count is derived from rsync's `to-chk=R/T` markers as `T - R`.
pub struct RsyncCopyEngine {
    binary_path: PathBuf,
}

impl RsyncCopyEngine {
    /// Create an engine with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find rsync in PATH
    pub fn from_path() -> Option<Self> {
        which::which("rsync").ok().map(Self::new)
    }

    fn args(source: &Path, destination: &Path) -> Vec<OsString> {
        // Trailing separators copy the contents, not the directory itself
        let mut src = source.as_os_str().to_os_string();
        src.push("/");
        let mut dst = destination.as_os_str().to_os_string();
        dst.push("/");

        vec!["-aHAXr".into(), "--progress".into(), src, dst]
    }
}

/// Parse the `(remaining, total)` pair from one rsync progress line
///
/// Returns `None` for lines without a progress marker.
pub fn parse_rsync_progress(line: &str) -> Option<(u64, u64)> {
    let rest = PROGRESS_MARKERS
        .iter()
        .find_map(|marker| line.find(marker).map(|i| &line[i + marker.len()..]))?;

    let end = rest.find(')').unwrap_or(rest.len());
    let (remaining, total) = rest[..end].split_once('/')?;
    let remaining = remaining.trim().parse().ok()?;
    let total = total.trim().parse().ok()?;
    Some((remaining, total))
}

#[async_trait]
impl CopyEngine for RsyncCopyEngine {
    async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        progress: ProgressCallback,
    ) -> Result<u64> {
        let copy_error = |reason: String| Error::Copy {
            path: source.to_path_buf(),
            reason,
        };

        let args = Self::args(source, destination);
        debug!(binary = ?self.binary_path, ?args, "starting rsync");

        let mut child = Command::new(&self.binary_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| copy_error(format!("failed to execute rsync: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| copy_error("rsync stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| copy_error("rsync stderr not captured".into()))?;

        // Drain stderr concurrently so a chatty rsync cannot block on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.ok();
            buf
        });

        let mut copied = 0u64;
        let mut segments = BufReader::new(stdout).split(b'\n');
        while let Some(segment) = segments
            .next_segment()
            .await
            .map_err(|e| copy_error(format!("failed to read rsync output: {}", e)))?
        {
            // Progress updates within a line are separated by carriage returns
            let text = String::from_utf8_lossy(&segment);
            for piece in text.split('\r') {
                if let Some((remaining, total)) = parse_rsync_progress(piece) {
                    let done = total.saturating_sub(remaining);
                    if done != copied {
                        copied = done;
                        progress(copied);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| copy_error(format!("failed to wait for rsync: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(copy_error(if stderr.is_empty() {
                format!("rsync exited with {}", status)
            } else {
                stderr
            }));
        }

        progress(copied);
        Ok(copied)
    }

    fn name(&self) -> &'static str {
        "rsync"
    }
}
