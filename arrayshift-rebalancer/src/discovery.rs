//! Disk discovery
//!
//! Enumerates data disks under the mount prefix, reads filesystem statistics
//! for each and returns a usage snapshot. The snapshot is taken once per run
//! and never refreshed during planning.

use crate::config::CoreConfig;
use arrayshift_core::Disk;
use regex::Regex;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Discovery errors. Fatal to the run.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No data disks found under {prefix} matching {pattern}; check --mount-prefix")]
    NoDisks { prefix: String, pattern: String },

    #[error("Included disk {0} is missing or not mounted")]
    MissingDisk(String),

    #[error("Invalid disk name pattern {pattern}: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Filesystem statistics for a mount point.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub size_bytes: u64,
    pub free_bytes: u64,
}

/// Query filesystem statistics via statvfs.
///
/// Free space is reported as available to unprivileged users (`f_bavail`),
/// matching what rsync can actually write into.
pub fn statvfs(path: &Path) -> std::io::Result<FsStats> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a standard POSIX call. We check the return value
    // before reading the output structure.
    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        let result = libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr());
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let stat = stat.assume_init();
        Ok(FsStats {
            size_bytes: stat.f_frsize as u64 * stat.f_blocks as u64,
            free_bytes: stat.f_frsize as u64 * stat.f_bavail as u64,
        })
    }
}

/// Enumerate data disks and snapshot their usage.
pub fn discover_disks(config: &CoreConfig) -> Result<Vec<Disk>> {
    let pattern =
        Regex::new(&config.disk_name_pattern).map_err(|source| DiscoveryError::BadPattern {
            pattern: config.disk_name_pattern.clone(),
            source,
        })?;

    let entries = std::fs::read_dir(&config.mount_prefix).map_err(|source| DiscoveryError::Io {
        path: config.mount_prefix.display().to_string(),
        source,
    })?;

    let mut disks = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable mount entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if !pattern.is_match(&name) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }
        if !config.include_disks.is_empty() && !config.include_disks.contains(&name) {
            continue;
        }
        if config.exclude_disks.contains(&name) {
            debug!(disk = %name, "Excluded by --exclude-disks");
            continue;
        }

        let mount = entry.path();
        let stats = match statvfs(&mount) {
            Ok(s) => s,
            Err(e) => {
                warn!(disk = %name, error = %e, "Skipping disk, statvfs failed");
                continue;
            }
        };

        disks.push(Disk {
            name,
            mount,
            size_bytes: stats.size_bytes,
            used_bytes: stats.size_bytes.saturating_sub(stats.free_bytes),
            free_bytes: stats.free_bytes,
        });
    }

    // Every explicitly included disk must have been found and mounted.
    for wanted in &config.include_disks {
        if config.exclude_disks.contains(wanted) {
            continue;
        }
        if !disks.iter().any(|d| &d.name == wanted) {
            return Err(DiscoveryError::MissingDisk(wanted.clone()));
        }
    }

    if disks.is_empty() {
        return Err(DiscoveryError::NoDisks {
            prefix: config.mount_prefix.display().to_string(),
            pattern: config.disk_name_pattern.clone(),
        });
    }

    disks.sort_by(|a, b| a.name.cmp(&b.name));

    info!(count = disks.len(), "Discovered data disks");
    for d in &disks {
        debug!(
            disk = %d.name,
            used = d.used_bytes,
            free = d.free_bytes,
            fill = format!("{:.1}%", d.fill_percent()),
            "Disk usage"
        );
    }

    Ok(disks)
}
