//! Transfer-state journal
//!
//! One JSON record per move under `<state_dir>/transfers/<op_id>.rec`, each
//! written atomically (temp file then rename). The journal is the durability
//! boundary: a move is only considered started once its `started` record has
//! been flushed, and on startup non-completed records whose owning process is
//! gone are offered for re-execution.

use arrayshift_core::{AllocationUnit, Move, MoveStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Journal errors. Fatal: durability is required.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Cannot access journal at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt journal record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

const RECORD_VERSION: u32 = 1;

/// Durable record of one in-flight or recently completed move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub version: u32,
    pub op_id: String,
    pub share: String,
    pub rel_path: String,
    pub src_disk: String,
    pub dest_disk: String,
    pub src_abs: PathBuf,
    pub dest_abs: PathBuf,
    pub size_bytes: u64,
    pub status: MoveStatus,
    pub attempts: u32,
    /// Process that owns the operation
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Rebuild the move this record describes, for re-execution.
    pub fn to_move(&self) -> arrayshift_core::Result<Move> {
        Ok(Move {
            unit: AllocationUnit::new(&self.src_disk, &self.share, &self.rel_path, self.size_bytes)?,
            dest_disk: self.dest_disk.clone(),
        })
    }
}

/// Append-only journal of transfer records.
#[derive(Debug, Clone)]
pub struct TransferJournal {
    dir: PathBuf,
}

impl TransferJournal {
    /// Open (and create) the journal under a state directory.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("transfers");
        std::fs::create_dir_all(&dir).map_err(|source| StateError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, op_id: &str) -> PathBuf {
        self.dir.join(format!("{op_id}.rec"))
    }

    /// Write a record atomically: temp file in the same directory, then
    /// rename over the final name.
    fn write(&self, record: &TransferRecord) -> Result<()> {
        let path = self.record_path(&record.op_id);
        let tmp = self.dir.join(format!("{}.rec.tmp", record.op_id));
        let json = serde_json::to_vec_pretty(record).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, json).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StateError::Io { path, source })?;
        Ok(())
    }

    /// Record a move as started. Flushed before the tool is spawned.
    pub fn record_start(&self, mv: &Move, mount_prefix: &Path) -> Result<TransferRecord> {
        let now = Utc::now();
        let record = TransferRecord {
            version: RECORD_VERSION,
            op_id: Uuid::new_v4().to_string(),
            share: mv.unit.share.clone(),
            rel_path: mv.unit.rel_path.clone(),
            src_disk: mv.unit.src_disk.clone(),
            dest_disk: mv.dest_disk.clone(),
            src_abs: mv.unit.src_abs(mount_prefix),
            dest_abs: mv.unit.dest_abs(mount_prefix, &mv.dest_disk),
            size_bytes: mv.size_bytes(),
            status: MoveStatus::InFlight,
            attempts: 0,
            pid: std::process::id(),
            started_at: now,
            updated_at: now,
        };
        self.write(&record)?;
        debug!(op_id = %record.op_id, unit = %mv.unit.share_path(), "Journaled move start");
        Ok(record)
    }

    /// Update a record's status (and attempt counter) in place.
    pub fn update(&self, record: &mut TransferRecord, status: MoveStatus) -> Result<()> {
        record.status = status;
        record.updated_at = Utc::now();
        self.write(record)
    }

    pub fn bump_attempts(&self, record: &mut TransferRecord) -> Result<()> {
        record.attempts += 1;
        record.updated_at = Utc::now();
        self.write(record)
    }

    /// Load every record in the journal.
    pub fn load_all(&self) -> Result<Vec<TransferRecord>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StateError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StateError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().map(|e| e != "rec").unwrap_or(true) {
                continue;
            }
            let content = std::fs::read(&path).map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_slice::<TransferRecord>(&content) {
                Ok(record) => records.push(record),
                Err(source) => {
                    // A torn record cannot happen through the rename path;
                    // surface it rather than silently resuming without it.
                    return Err(StateError::Corrupt { path, source });
                }
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    /// Records that never reached `completed`, oldest first.
    pub fn incomplete(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.status != MoveStatus::Completed)
            .collect())
    }

    /// Incomplete records whose owning process is gone and whose destination
    /// shows signs of a partial transfer. These are safe to re-run: the tool
    /// skips bytes that already reached the destination.
    pub fn find_orphans(&self) -> Result<Vec<TransferRecord>> {
        let orphans: Vec<_> = self
            .incomplete()?
            .into_iter()
            .filter(|r| !process_alive(r.pid))
            .filter(|r| r.dest_abs.exists() || r.src_abs.exists())
            .collect();
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Found orphaned transfers to resume");
        }
        Ok(orphans)
    }

    /// Delete completed records older than the retention threshold.
    pub fn purge_completed(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
        let mut purged = 0;
        for record in self.load_all()? {
            if record.status == MoveStatus::Completed && record.updated_at < cutoff {
                let path = self.record_path(&record.op_id);
                match std::fs::remove_file(&path) {
                    Ok(()) => purged += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge record"),
                }
            }
        }
        if purged > 0 {
            debug!(purged, "Purged old journal records");
        }
        Ok(purged)
    }

}

/// Whether a pid refers to a live process on this host.
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_move() -> Move {
        Move {
            unit: AllocationUnit::new("disk1", "Movies", "Alien", 4096).unwrap(),
            dest_disk: "disk2".to_string(),
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let journal = TransferJournal::open(tmp.path()).unwrap();

        let mut record = journal
            .record_start(&make_move(), Path::new("/mnt"))
            .unwrap();
        assert_eq!(record.status, MoveStatus::InFlight);
        assert_eq!(record.src_abs, PathBuf::from("/mnt/disk1/Movies/Alien"));
        assert_eq!(record.dest_abs, PathBuf::from("/mnt/disk2/Movies/Alien"));

        journal.bump_attempts(&mut record).unwrap();
        journal.update(&mut record, MoveStatus::Completed).unwrap();

        let loaded = journal.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, MoveStatus::Completed);
        assert_eq!(loaded[0].attempts, 1);
        assert!(journal.incomplete().unwrap().is_empty());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let journal = TransferJournal::open(tmp.path()).unwrap();
        journal
            .record_start(&make_move(), Path::new("/mnt"))
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("transfers"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_record_roundtrips_to_move() {
        let tmp = TempDir::new().unwrap();
        let journal = TransferJournal::open(tmp.path()).unwrap();
        let mv = make_move();
        let record = journal.record_start(&mv, Path::new("/mnt")).unwrap();
        assert_eq!(record.to_move().unwrap(), mv);
    }

    #[test]
    fn test_orphan_detection() {
        let tmp = TempDir::new().unwrap();
        let journal = TransferJournal::open(tmp.path()).unwrap();

        // Record owned by this very process: not an orphan.
        let live = journal
            .record_start(&make_move(), Path::new("/mnt"))
            .unwrap();

        // Record owned by a reaped child process, with a partial destination.
        let dest_root = tmp.path().join("array");
        std::fs::create_dir_all(dest_root.join("disk2/Movies/Alien")).unwrap();
        let dead_pid = {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let pid = child.id();
            child.wait().unwrap();
            pid
        };
        let mut dead = journal.record_start(&make_move(), &dest_root).unwrap();
        dead.pid = dead_pid;
        journal.update(&mut dead, MoveStatus::InFlight).unwrap();

        let orphans = journal.find_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].op_id, dead.op_id);
        assert_ne!(orphans[0].op_id, live.op_id);
    }

    #[test]
    fn test_purge_completed_respects_retention() {
        let tmp = TempDir::new().unwrap();
        let journal = TransferJournal::open(tmp.path()).unwrap();

        let mut old = journal
            .record_start(&make_move(), Path::new("/mnt"))
            .unwrap();
        old.status = MoveStatus::Completed;
        old.updated_at = Utc::now() - chrono::Duration::days(30);
        journal.write(&old).unwrap();

        let mut fresh = journal
            .record_start(&make_move(), Path::new("/mnt"))
            .unwrap();
        journal.update(&mut fresh, MoveStatus::Completed).unwrap();

        let purged = journal.purge_completed(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(purged, 1);

        let remaining = journal.load_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op_id, fresh.op_id);
    }
}
