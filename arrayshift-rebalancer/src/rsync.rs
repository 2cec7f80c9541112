//! Rsync invocation
//!
//! Builds the argument vector for the selected performance mode and drives
//! the subprocess, streaming its progress output. Every invocation runs in
//! atomic-move mode: rsync copies into the destination and removes source
//! files as their destination bytes become durable, so an interrupted move
//! can be resumed by re-running the same command.

use crate::progress::{ProgressTracker, TransferProgress};
use arrayshift_core::RsyncMode;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Invocation errors (distinct from non-zero tool exits, which are
/// classified by the caller).
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("Failed to read tool output: {0}")]
    Stream(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InvokeError>;

/// Flag set for a performance mode.
///
/// All modes request `--info=progress2` so the progress parser always has a
/// stream to work with; `integrity` adds hard links, ACLs and a full content
/// checksum pass.
pub fn mode_flags(mode: RsyncMode) -> &'static [&'static str] {
    match mode {
        RsyncMode::Fast => &[
            "-a",
            "--partial",
            "--inplace",
            "--numeric-ids",
            "--info=progress2",
        ],
        RsyncMode::Balanced => &[
            "-a",
            "-X",
            "--partial",
            "--inplace",
            "--numeric-ids",
            "--info=progress2",
        ],
        RsyncMode::Integrity => &[
            "-a",
            "-H",
            "-A",
            "-X",
            "--checksum",
            "--partial",
            "--inplace",
            "--numeric-ids",
            "--info=progress2",
        ],
    }
}

/// One-line description per mode, shown by `--list-rsync-modes`.
pub fn mode_description(mode: RsyncMode) -> &'static str {
    match mode {
        RsyncMode::Fast => "fastest transfers, minimal CPU overhead",
        RsyncMode::Balanced => "balanced speed and features with extended attributes",
        RsyncMode::Integrity => "full integrity checking with hard links, ACLs and checksums",
    }
}

/// Resolve the tool executable: an explicit path must exist, a bare name is
/// searched on PATH.
pub fn resolve_tool(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|p| p.is_file())
}

/// A fully-built rsync invocation for one move.
#[derive(Debug, Clone)]
pub struct RsyncInvocation {
    pub tool: String,
    pub args: Vec<String>,
}

impl RsyncInvocation {
    /// Build the argument vector for an atomic move.
    ///
    /// A directory source gets a trailing slash so its *contents* land in the
    /// destination directory, matching the unit's identity on both disks.
    pub fn build(
        tool: &str,
        mode: RsyncMode,
        extra: &[String],
        source: &Path,
        dest: &Path,
        source_is_dir: bool,
    ) -> Self {
        let mut args: Vec<String> = mode_flags(mode).iter().map(|s| s.to_string()).collect();
        args.push("--remove-source-files".to_string());
        args.extend(extra.iter().cloned());

        let mut src = source.display().to_string();
        if source_is_dir && !src.ends_with('/') {
            src.push('/');
        }
        args.push(src);
        args.push(dest.display().to_string());

        Self {
            tool: tool.to_string(),
            args,
        }
    }

    /// Render the command for logging and dry-run display.
    pub fn display_line(&self) -> String {
        let mut parts = vec![self.tool.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Result of one subprocess run.
#[derive(Debug, Clone)]
pub struct RsyncOutcome {
    pub exit_code: i32,
    pub stderr: String,
    pub timed_out: bool,
    pub final_progress: TransferProgress,
}

/// Spawn the tool and stream its output until exit or timeout.
///
/// Progress updates are pushed to `progress_tx` as they are parsed; the
/// subscriber may lag or disappear without affecting the transfer.
pub async fn run(
    invocation: &RsyncInvocation,
    total_bytes: u64,
    timeout: Duration,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
) -> Result<RsyncOutcome> {
    debug!(command = %invocation.display_line(), "Spawning rsync");

    let mut child = Command::new(&invocation.tool)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| InvokeError::Spawn {
            tool: invocation.tool.clone(),
            source,
        })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let mut tracker = ProgressTracker::new(total_bytes);
    let tx = progress_tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(update) = tracker.feed(&line) {
                if let Some(tx) = &tx {
                    let _ = tx.try_send(update);
                }
            }
        }
        tracker.snapshot()
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(line = %line, "rsync stderr");
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code().unwrap_or(-1), false),
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Move timed out, terminating rsync");
            let _ = child.kill().await;
            let _ = child.wait().await;
            (-1, true)
        }
    };

    let final_progress = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(RsyncOutcome {
        exit_code,
        stderr,
        timed_out,
        final_progress,
    })
}

/// Remove the directories rsync leaves behind after `--remove-source-files`.
///
/// Walks bottom-up and deletes only empty directories; anything non-empty is
/// left for the post-transfer validator to flag.
pub fn prune_empty_dirs(root: &Path) -> std::io::Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        match std::fs::remove_dir(&dir) {
            Ok(()) => {}
            // Not empty or already gone: leave it.
            Err(_) => continue,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_mode_flags() {
        assert!(mode_flags(RsyncMode::Fast).contains(&"-a"));
        assert!(!mode_flags(RsyncMode::Fast).contains(&"-X"));
        assert!(mode_flags(RsyncMode::Balanced).contains(&"-X"));
        for flag in ["-H", "-A", "-X", "--checksum"] {
            assert!(mode_flags(RsyncMode::Integrity).contains(&flag));
        }
        for mode in [RsyncMode::Fast, RsyncMode::Balanced, RsyncMode::Integrity] {
            assert!(mode_flags(mode).contains(&"--info=progress2"));
            assert!(mode_flags(mode).contains(&"--partial"));
        }
    }

    #[test]
    fn test_invocation_order() {
        let inv = RsyncInvocation::build(
            "rsync",
            RsyncMode::Fast,
            &["--bwlimit=50M".to_string()],
            Path::new("/mnt/disk1/Movies/Alien"),
            Path::new("/mnt/disk2/Movies/Alien"),
            true,
        );

        // Base flags, then atomic-move flag, then user extras, then paths.
        let remove_pos = inv
            .args
            .iter()
            .position(|a| a == "--remove-source-files")
            .unwrap();
        let extra_pos = inv.args.iter().position(|a| a == "--bwlimit=50M").unwrap();
        assert!(remove_pos < extra_pos);
        assert_eq!(inv.args[inv.args.len() - 2], "/mnt/disk1/Movies/Alien/");
        assert_eq!(inv.args[inv.args.len() - 1], "/mnt/disk2/Movies/Alien");
    }

    #[test]
    fn test_invocation_file_source_keeps_exact_path() {
        let inv = RsyncInvocation::build(
            "rsync",
            RsyncMode::Fast,
            &[],
            Path::new("/mnt/disk1/Movies/stray.mkv"),
            Path::new("/mnt/disk2/Movies/stray.mkv"),
            false,
        );
        assert_eq!(inv.args[inv.args.len() - 2], "/mnt/disk1/Movies/stray.mkv");
    }

    #[test]
    fn test_resolve_tool() {
        assert!(resolve_tool("sh").is_some());
        assert!(resolve_tool("/bin/sh").is_some());
        assert!(resolve_tool("definitely-not-a-real-tool-xyz").is_none());
        assert!(resolve_tool("/nonexistent/path/tool").is_none());
    }

    #[test]
    fn test_prune_empty_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("unit");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("c")).unwrap();
        fs::write(root.join("c/keep.txt"), b"data").unwrap();

        prune_empty_dirs(&root).unwrap();

        assert!(!root.join("a").exists());
        assert!(root.join("c/keep.txt").exists());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_run_captures_exit_and_stderr() {
        let inv = RsyncInvocation {
            tool: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo oops >&2; exit 23".to_string(),
            ],
        };
        let outcome = run(&inv, 0, Duration::from_secs(5), None).await.unwrap();
        assert_eq!(outcome.exit_code, 23);
        assert!(outcome.stderr.contains("oops"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let inv = RsyncInvocation {
            tool: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
        };
        let outcome = run(&inv, 0, Duration::from_millis(100), None).await.unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn test_run_streams_progress() {
        let (tx, mut rx) = mpsc::channel(16);
        let inv = RsyncInvocation {
            tool: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "printf '1,000  50%%  1.00MB/s  0:00:01\\n2,000  100%%  1.00MB/s  0:00:02\\n'"
                    .to_string(),
            ],
        };
        let outcome = run(&inv, 2_000, Duration::from_secs(5), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.final_progress.bytes_done, 2_000);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.bytes_done, 1_000);
    }
}
