//! Data model for the ArrayShift rebalancer.
//!
//! A JBOD array is a set of independently mounted data disks under a common
//! prefix (`/mnt/disk1`, `/mnt/disk2`, ...). Each disk carries per-share
//! subtrees; the rebalancer moves whole *allocation units* (subtrees at a
//! configured depth below a share root) between disks.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A data disk in the array, with usage as snapshotted at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Stable disk name (e.g. `disk1`)
    pub name: String,
    /// Mount path (e.g. `/mnt/disk1`)
    pub mount: PathBuf,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl Disk {
    /// Current fill level as a percentage (0.0 - 100.0).
    pub fn fill_percent(&self) -> f64 {
        if self.size_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.size_bytes as f64) * 100.0
    }
}

/// An allocation unit: the smallest subtree moved as a whole.
///
/// Identified by `(share, rel_path)`; `rel_path` is measured from the share
/// root and is empty when the unit is the whole share on a disk
/// (`unit_depth = 0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationUnit {
    /// Disk the unit currently lives on
    pub src_disk: String,
    /// Top-level share name (e.g. `Movies`)
    pub share: String,
    /// Path relative to the share root (e.g. `Alien (1979)`)
    pub rel_path: String,
    /// Total size of all regular files in the subtree
    pub size_bytes: u64,
}

impl AllocationUnit {
    /// Create a unit, rejecting paths that could escape the share root.
    pub fn new(src_disk: &str, share: &str, rel_path: &str, size_bytes: u64) -> Result<Self> {
        if Path::new(rel_path).is_absolute() {
            return Err(CoreError::InvalidUnitPath {
                path: rel_path.to_string(),
                reason: "absolute path".to_string(),
            });
        }
        if rel_path.split('/').any(|c| c == "..") {
            return Err(CoreError::InvalidUnitPath {
                path: rel_path.to_string(),
                reason: "path traversal".to_string(),
            });
        }
        Ok(Self {
            src_disk: src_disk.to_string(),
            share: share.to_string(),
            rel_path: rel_path.to_string(),
            size_bytes,
        })
    }

    /// `share/rel_path` display form, used for logging and glob matching.
    pub fn share_path(&self) -> String {
        if self.rel_path.is_empty() {
            self.share.clone()
        } else {
            format!("{}/{}", self.share, self.rel_path)
        }
    }

    /// Absolute source path under the given mount prefix.
    pub fn src_abs(&self, mount_prefix: &Path) -> PathBuf {
        self.abs_on(mount_prefix, &self.src_disk)
    }

    /// Absolute destination path for a candidate destination disk.
    pub fn dest_abs(&self, mount_prefix: &Path, dest_disk: &str) -> PathBuf {
        self.abs_on(mount_prefix, dest_disk)
    }

    fn abs_on(&self, mount_prefix: &Path, disk: &str) -> PathBuf {
        let mut p = mount_prefix.join(disk).join(&self.share);
        if !self.rel_path.is_empty() {
            p = p.join(&self.rel_path);
        }
        p
    }
}

/// Lifecycle of a planned move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Planned,
    InFlight,
    Completed,
    Failed,
    Aborted,
}

impl MoveStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the move has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for MoveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned transfer of one allocation unit between two disks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub unit: AllocationUnit,
    pub dest_disk: String,
}

impl Move {
    pub fn src_disk(&self) -> &str {
        &self.unit.src_disk
    }

    pub fn size_bytes(&self) -> u64 {
        self.unit.size_bytes
    }
}

/// Unit-selection strategy for the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Largest units first, preferring fewer moves
    #[default]
    Size,
    /// Most-pressured source disks shed first
    LowSpaceFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size => f.write_str("size"),
            Self::LowSpaceFirst => f.write_str("low_space_first"),
        }
    }
}

impl FromStr for Strategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "size" => Ok(Self::Size),
            "low_space_first" => Ok(Self::LowSpaceFirst),
            _ => Err(CoreError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Rsync performance mode, selecting the flag set and integrity guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RsyncMode {
    /// Fastest transfers, minimal CPU overhead
    #[default]
    Fast,
    /// Balanced speed and features with extended attributes
    Balanced,
    /// Full integrity checking with hard links, ACLs, and checksums
    Integrity,
}

impl fmt::Display for RsyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Balanced => f.write_str("balanced"),
            Self::Integrity => f.write_str("integrity"),
        }
    }
}

impl FromStr for RsyncMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "integrity" => Ok(Self::Integrity),
            _ => Err(CoreError::UnknownRsyncMode(s.to_string())),
        }
    }
}

/// Options the plan was computed with, carried in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    pub target_percent: f64,
    pub headroom_percent: f64,
    pub strategy: Strategy,
    pub rsync_mode: RsyncMode,
    pub unit_depth: usize,
    pub min_unit_size: u64,
}

/// An ordered sequence of moves plus the disk snapshot it was planned against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub disks: Vec<Disk>,
    pub moves: Vec<Move>,
    pub options: PlanOptions,
}

impl Plan {
    /// Total bytes across all planned moves.
    pub fn total_bytes(&self) -> u64 {
        self.moves.iter().map(|m| m.size_bytes()).sum()
    }

    /// Summary of the plan.
    pub fn summary(&self) -> String {
        format!(
            "{} moves, {} to redistribute across {} disks",
            self.moves.len(),
            crate::bytes::format_bytes(self.total_bytes()),
            self.disks.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unit(disk: &str, share: &str, rel: &str, size: u64) -> AllocationUnit {
        AllocationUnit::new(disk, share, rel, size).unwrap()
    }

    #[test]
    fn test_fill_percent() {
        let disk = Disk {
            name: "disk1".to_string(),
            mount: PathBuf::from("/mnt/disk1"),
            size_bytes: 1000,
            used_bytes: 250,
            free_bytes: 750,
        };
        assert!((disk.fill_percent() - 25.0).abs() < f64::EPSILON);

        let empty = Disk {
            name: "disk2".to_string(),
            mount: PathBuf::from("/mnt/disk2"),
            size_bytes: 0,
            used_bytes: 0,
            free_bytes: 0,
        };
        assert_eq!(empty.fill_percent(), 0.0);
    }

    #[test]
    fn test_unit_paths() {
        let unit = make_unit("disk1", "Movies", "Alien (1979)", 100);
        assert_eq!(
            unit.src_abs(Path::new("/mnt")),
            PathBuf::from("/mnt/disk1/Movies/Alien (1979)")
        );
        assert_eq!(
            unit.dest_abs(Path::new("/mnt"), "disk2"),
            PathBuf::from("/mnt/disk2/Movies/Alien (1979)")
        );
        assert_eq!(unit.share_path(), "Movies/Alien (1979)");
    }

    #[test]
    fn test_whole_share_unit() {
        let unit = make_unit("disk1", "Movies", "", 100);
        assert_eq!(
            unit.src_abs(Path::new("/mnt")),
            PathBuf::from("/mnt/disk1/Movies")
        );
        assert_eq!(unit.share_path(), "Movies");
    }

    #[test]
    fn test_unit_rejects_escaping_paths() {
        assert!(AllocationUnit::new("disk1", "Movies", "../etc", 1).is_err());
        assert!(AllocationUnit::new("disk1", "Movies", "a/../../b", 1).is_err());
        assert!(AllocationUnit::new("disk1", "Movies", "/abs", 1).is_err());
        assert!(AllocationUnit::new("disk1", "Movies", "a/b", 1).is_ok());
    }

    #[test]
    fn test_status_roundtrip() {
        let json = serde_json::to_string(&MoveStatus::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
        let back: MoveStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MoveStatus::InFlight);
        assert!(MoveStatus::Completed.is_terminal());
        assert!(!MoveStatus::Planned.is_terminal());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("size".parse::<Strategy>().unwrap(), Strategy::Size);
        assert_eq!(
            "low_space_first".parse::<Strategy>().unwrap(),
            Strategy::LowSpaceFirst
        );
        assert!("foo".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_plan_totals() {
        let plan = Plan {
            disks: vec![],
            moves: vec![
                Move {
                    unit: make_unit("disk1", "Movies", "a", 100),
                    dest_disk: "disk2".to_string(),
                },
                Move {
                    unit: make_unit("disk1", "Movies", "b", 50),
                    dest_disk: "disk2".to_string(),
                },
            ],
            options: PlanOptions {
                target_percent: 80.0,
                headroom_percent: 5.0,
                strategy: Strategy::Size,
                rsync_mode: RsyncMode::Fast,
                unit_depth: 1,
                min_unit_size: 1,
            },
        };
        assert_eq!(plan.total_bytes(), 150);
        assert!(plan.summary().contains("2 moves"));
    }
}
