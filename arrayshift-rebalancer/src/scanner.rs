//! Allocation-unit scanner
//!
//! Walks each disk's shares to the configured unit depth and emits sized
//! allocation units. Candidates below `min_unit_size` are skipped; exclude
//! globs are matched against the `share/rel_path` string. Output is sorted by
//! `(disk, share, rel_path)` so identical inputs always produce identical
//! unit lists.

use crate::config::CoreConfig;
use crate::discovery::DiscoveryError;
use arrayshift_core::{AllocationUnit, Disk};
use regex::Regex;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scanner errors
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid exclude glob {glob}: {reason}")]
    BadGlob { glob: String, reason: String },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// A set of exclude globs compiled to anchored regexes.
///
/// Supports `*`, `?` and `[...]` with fnmatch semantics: `*` matches any run
/// of characters including `/`.
#[derive(Debug, Default)]
pub struct GlobSet {
    patterns: Vec<Regex>,
}

impl GlobSet {
    pub fn compile(globs: &[String]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| {
                let expr = glob_to_regex(g).ok_or_else(|| ScanError::BadGlob {
                    glob: g.clone(),
                    reason: "unclosed character class".to_string(),
                })?;
                Regex::new(&expr).map_err(|e| ScanError::BadGlob {
                    glob: g.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Translate a glob into an anchored regex expression.
fn glob_to_regex(glob: &str) -> Option<String> {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        out.push_str("\\\\");
                    } else {
                        out.push(inner);
                    }
                }
                if !closed {
                    return None;
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Some(out)
}

/// Sum the sizes of all regular files under a path.
///
/// Symlinks are not followed and their targets are not counted. Unreadable
/// entries are logged and skipped.
pub fn subtree_size(path: &Path) -> u64 {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => total += meta.len(),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping entry, stat failed");
            }
        }
    }
    total
}

/// Scan all disks for allocation units.
pub fn scan_units(config: &CoreConfig, disks: &[Disk]) -> Result<Vec<AllocationUnit>> {
    let globs = GlobSet::compile(&config.exclude_globs)?;

    let mut units = Vec::new();
    for disk in disks {
        units.extend(scan_disk(config, disk, &globs)?);
    }
    units.sort_by(|a, b| {
        (&a.src_disk, &a.share, &a.rel_path).cmp(&(&b.src_disk, &b.share, &b.rel_path))
    });

    info!(
        units = units.len(),
        bytes = units.iter().map(|u| u.size_bytes).sum::<u64>(),
        "Allocation unit scan complete"
    );
    Ok(units)
}

/// Scan one disk's shares.
fn scan_disk(config: &CoreConfig, disk: &Disk, globs: &GlobSet) -> Result<Vec<AllocationUnit>> {
    let entries = std::fs::read_dir(&disk.mount).map_err(|source| DiscoveryError::Io {
        path: disk.mount.display().to_string(),
        source,
    })?;

    let mut units = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(disk = %disk.name, error = %e, "Skipping unreadable share entry");
                continue;
            }
        };
        if !entry.path().is_dir() {
            continue;
        }
        let share = entry.file_name().to_string_lossy().to_string();
        if !config.include_shares.is_empty() && !config.include_shares.contains(&share) {
            continue;
        }
        if config.exclude_shares.contains(&share) {
            debug!(disk = %disk.name, share = %share, "Excluded by --exclude-shares");
            continue;
        }

        collect_candidates(
            config,
            disk,
            &share,
            &entry.path(),
            config.unit_depth,
            globs,
            &mut units,
        );
    }
    Ok(units)
}

/// Descend below a share root until the target depth and emit units.
///
/// Files encountered at the target depth count as units too; directories at
/// intermediate depths that turn out to be files are ignored.
fn collect_candidates(
    config: &CoreConfig,
    disk: &Disk,
    share: &str,
    dir: &Path,
    depth_left: usize,
    globs: &GlobSet,
    out: &mut Vec<AllocationUnit>,
) {
    if depth_left == 0 {
        let share_root = disk.mount.join(share);
        let rel = dir
            .strip_prefix(&share_root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        emit_candidate(config, disk, share, &rel, dir, globs, out);
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping entry, stat failed");
                continue;
            }
        };
        if file_type.is_symlink() {
            debug!(path = %path.display(), "Skipping symlink");
            continue;
        }
        if file_type.is_dir() {
            collect_candidates(config, disk, share, &path, depth_left - 1, globs, out);
        } else if file_type.is_file() && depth_left == 1 {
            // Loose files at the target depth move as single-file units.
            let share_root = disk.mount.join(share);
            let rel = path
                .strip_prefix(&share_root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            emit_candidate(config, disk, share, &rel, &path, globs, out);
        }
    }
}

fn emit_candidate(
    config: &CoreConfig,
    disk: &Disk,
    share: &str,
    rel: &str,
    path: &Path,
    globs: &GlobSet,
    out: &mut Vec<AllocationUnit>,
) {
    let match_key = if rel.is_empty() {
        share.to_string()
    } else {
        format!("{}/{}", share, rel)
    };
    if globs.is_match(&match_key) {
        debug!(unit = %match_key, "Excluded by glob");
        return;
    }

    let size = if path.is_file() {
        path.metadata().map(|m| m.len()).unwrap_or(0)
    } else {
        subtree_size(path)
    };
    if size < config.min_unit_size {
        debug!(unit = %match_key, size, "Below minimum unit size");
        return;
    }

    match AllocationUnit::new(&disk.name, share, rel, size) {
        Ok(unit) => out.push(unit),
        Err(e) => warn!(unit = %match_key, error = %e, "Rejected candidate"),
    }
}
