//! Pre- and post-transfer validation
//!
//! Pre-checks gate a move before the tool is spawned; post-checks confirm the
//! atomic-move invariants afterwards: destination present, source bytes gone,
//! sizes consistent.

use crate::config::CoreConfig;
use crate::discovery::statvfs;
use crate::rsync::resolve_tool;
use crate::scanner::subtree_size;
use arrayshift_core::{format_bytes, Move};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Working buffer required on the destination beyond the raw unit size.
const SPACE_BUFFER_FACTOR: f64 = 1.10;

/// A move failed its preconditions and never started.
#[derive(Error, Debug)]
pub enum PreValidationError {
    #[error("Source {0} does not exist or is not a regular file or directory")]
    SourceMissing(PathBuf),

    #[error("Cannot create destination parent {path}: {source}")]
    DestinationParent {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "Destination {disk} has {available} free but the move needs {needed}; \
         free space or lower the target"
    )]
    InsufficientSpace {
        disk: String,
        available: String,
        needed: String,
    },

    #[error("Destination {0} already exists; pass --allow-merge to merge into it")]
    DestinationExists(PathBuf),

    #[error("Source and destination disk are both {0}")]
    SameDisk(String),

    #[error("Path {0} escapes the mount prefix")]
    OutsidePrefix(PathBuf),

    #[error("Copy tool {0} not found; install rsync or set --rsync-path")]
    ToolNotFound(String),

    #[error("Cannot stat destination disk {disk}: {source}")]
    DiskStat {
        disk: String,
        source: std::io::Error,
    },
}

/// The move finished but the atomic-move invariants do not hold.
#[derive(Error, Debug)]
pub enum PostValidationError {
    #[error("Destination {0} missing after transfer")]
    DestinationMissing(PathBuf),

    #[error("Destination {path} is a {actual} but the source was a {expected}")]
    KindMismatch {
        path: PathBuf,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Source {path} still holds {files} file(s) after the move")]
    SourceStillPresent { path: PathBuf, files: usize },

    #[error("Destination size {actual} does not match the planned {expected}")]
    SizeMismatch { expected: String, actual: String },
}

/// Run all pre-transfer checks for a move.
pub fn pre_checks(config: &CoreConfig, mv: &Move) -> Result<(), PreValidationError> {
    let src = mv.unit.src_abs(&config.mount_prefix);
    let dest = mv.unit.dest_abs(&config.mount_prefix, &mv.dest_disk);

    if mv.src_disk() == mv.dest_disk {
        return Err(PreValidationError::SameDisk(mv.dest_disk.clone()));
    }
    for path in [&src, &dest] {
        if !path.starts_with(&config.mount_prefix) {
            return Err(PreValidationError::OutsidePrefix(path.clone()));
        }
    }

    let meta = std::fs::symlink_metadata(&src)
        .map_err(|_| PreValidationError::SourceMissing(src.clone()))?;
    if !meta.is_dir() && !meta.is_file() {
        return Err(PreValidationError::SourceMissing(src.clone()));
    }

    if dest.exists() && !config.allow_merge {
        return Err(PreValidationError::DestinationExists(dest));
    }

    if resolve_tool(&config.rsync_path).is_none() {
        return Err(PreValidationError::ToolNotFound(config.rsync_path.clone()));
    }

    let dest_mount = config.mount_prefix.join(&mv.dest_disk);
    let stats = statvfs(&dest_mount).map_err(|source| PreValidationError::DiskStat {
        disk: mv.dest_disk.clone(),
        source,
    })?;
    let needed = (mv.size_bytes() as f64 * SPACE_BUFFER_FACTOR) as u64;
    if stats.free_bytes < needed {
        return Err(PreValidationError::InsufficientSpace {
            disk: mv.dest_disk.clone(),
            available: format_bytes(stats.free_bytes),
            needed: format_bytes(needed),
        });
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| {
            PreValidationError::DestinationParent {
                path: parent.to_path_buf(),
                source,
            }
        })?;
    }

    debug!(unit = %mv.unit.share_path(), dest = %mv.dest_disk, "Pre-transfer checks passed");
    Ok(())
}

/// Count regular files still present under a path.
fn files_under(path: &Path) -> usize {
    if path.is_file() {
        return 1;
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

/// Run all post-transfer checks for a move.
///
/// `source_was_dir` is captured before the transfer; `verify_size` enables
/// the optional size-equality check against the planned unit size.
pub fn post_checks(
    config: &CoreConfig,
    mv: &Move,
    source_was_dir: bool,
    verify_size: bool,
) -> Result<(), PostValidationError> {
    let src = mv.unit.src_abs(&config.mount_prefix);
    let dest = mv.unit.dest_abs(&config.mount_prefix, &mv.dest_disk);

    let meta = std::fs::symlink_metadata(&dest)
        .map_err(|_| PostValidationError::DestinationMissing(dest.clone()))?;
    let dest_is_dir = meta.is_dir();
    if dest_is_dir != source_was_dir {
        return Err(PostValidationError::KindMismatch {
            path: dest,
            expected: if source_was_dir { "directory" } else { "file" },
            actual: if dest_is_dir { "directory" } else { "file" },
        });
    }

    // Empty directory skeletons are pruned separately; bytes are what count.
    if src.exists() {
        let files = files_under(&src);
        if files > 0 {
            return Err(PostValidationError::SourceStillPresent { path: src, files });
        }
    }

    if verify_size {
        let actual = if dest_is_dir {
            subtree_size(&dest)
        } else {
            meta.len()
        };
        if actual != mv.size_bytes() {
            return Err(PostValidationError::SizeMismatch {
                expected: format_bytes(mv.size_bytes()),
                actual: format_bytes(actual),
            });
        }
    }

    debug!(unit = %mv.unit.share_path(), dest = %mv.dest_disk, "Post-transfer checks passed");
    Ok(())
}
