//! Plan file serialization
//!
//! Stable on-disk JSON form for plans, so a reviewed plan can be saved from a
//! dry run and executed later. Fields this version does not know about are
//! preserved across a load/save round trip.

use arrayshift_core::{AllocationUnit, Disk, Move, Plan, PlanOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Current plan schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Plan file errors
#[derive(Error, Debug)]
pub enum PlanFileError {
    #[error("Cannot access plan file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid plan file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Plan file {path} has schema version {found}, newer than supported {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Plan file contains an invalid move: {0}")]
    InvalidMove(#[from] arrayshift_core::CoreError),
}

pub type Result<T> = std::result::Result<T, PlanFileError>;

/// Disk usage snapshot as stored in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub name: String,
    pub size: u64,
    pub used: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One move as stored in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEntry {
    pub share: String,
    pub rel_path: String,
    pub src_disk: String,
    pub dest_disk: String,
    pub size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The on-disk plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub disks: Vec<DiskSnapshot>,
    pub moves: Vec<MoveEntry>,
    pub options: PlanOptions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanFile {
    /// Capture a plan into its on-disk form.
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            disks: plan
                .disks
                .iter()
                .map(|d| DiskSnapshot {
                    name: d.name.clone(),
                    size: d.size_bytes,
                    used: d.used_bytes,
                    extra: Map::new(),
                })
                .collect(),
            moves: plan
                .moves
                .iter()
                .map(|m| MoveEntry {
                    share: m.unit.share.clone(),
                    rel_path: m.unit.rel_path.clone(),
                    src_disk: m.unit.src_disk.clone(),
                    dest_disk: m.dest_disk.clone(),
                    size: m.size_bytes(),
                    extra: Map::new(),
                })
                .collect(),
            options: plan.options.clone(),
            extra: Map::new(),
        }
    }

    /// Rebuild the executable plan. Disk mounts are derived from the mount
    /// prefix, as they are not part of the stable format.
    pub fn into_plan(self, mount_prefix: &Path) -> Result<Plan> {
        let disks = self
            .disks
            .into_iter()
            .map(|d| Disk {
                mount: mount_prefix.join(&d.name),
                free_bytes: d.size.saturating_sub(d.used),
                name: d.name,
                size_bytes: d.size,
                used_bytes: d.used,
            })
            .collect();
        let moves = self
            .moves
            .into_iter()
            .map(|m| {
                Ok(Move {
                    unit: AllocationUnit::new(&m.src_disk, &m.share, &m.rel_path, m.size)?,
                    dest_disk: m.dest_disk,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Plan {
            disks,
            moves,
            options: self.options,
        })
    }

    /// Load a plan file, rejecting versions newer than this build.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).map_err(|source| PlanFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PlanFile =
            serde_json::from_slice(&content).map_err(|source| PlanFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if file.schema_version > SCHEMA_VERSION {
            return Err(PlanFileError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: file.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(file)
    }

    /// Write the plan file (pretty-printed, for human review).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| PlanFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| PlanFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), moves = self.moves.len(), "Plan saved");
        Ok(())
    }
}

/// Save a plan to a file.
pub fn save_plan(plan: &Plan, path: &Path) -> Result<()> {
    PlanFile::from_plan(plan).save(path)
}

/// Load a plan from a file.
pub fn load_plan(path: &Path, mount_prefix: &Path) -> Result<Plan> {
    let file = PlanFile::load(path)?;
    info!(path = %path.display(), moves = file.moves.len(), "Plan loaded");
    file.into_plan(mount_prefix)
}
