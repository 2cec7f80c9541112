//! Transfer engine
//!
//! Executes a plan as a sequence of atomic per-unit transfers:
//! - Parallel across disjoint disk pairs, never more than one concurrent
//!   move per disk (as source or destination)
//! - Moves touching the same disk keep their plan order
//! - Retries recoverable failures with exponential backoff
//! - Journals every state transition before acting on it
//! - Updates the in-memory disk table only on verified completion
//!
//! A single cancel flag stops new-move dispatch; in-flight transfers are
//! allowed to finish because they are already atomic.

use crate::classify::{self, Category, Severity, Verdict};
use crate::config::CoreConfig;
use crate::journal::{StateError, TransferJournal, TransferRecord};
use crate::progress::TransferProgress;
use crate::rsync::{self, RsyncInvocation};
use crate::validate::{post_checks, pre_checks};
use arrayshift_core::{format_bytes, Disk, Move, MoveStatus, Plan};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// In-memory disk usage accounting, the only shared mutable state besides
/// the journal. Mutated only at verified move completion.
#[derive(Debug, Default)]
pub struct DiskTable {
    disks: HashMap<String, Disk>,
}

impl DiskTable {
    pub fn new(disks: &[Disk]) -> Self {
        Self {
            disks: disks.iter().map(|d| (d.name.clone(), d.clone())).collect(),
        }
    }

    /// Shift accounting for one completed move.
    pub fn apply_move(&mut self, src: &str, dest: &str, size: u64) {
        if let Some(d) = self.disks.get_mut(src) {
            d.used_bytes = d.used_bytes.saturating_sub(size);
            d.free_bytes = d.free_bytes.saturating_add(size);
        }
        if let Some(d) = self.disks.get_mut(dest) {
            d.used_bytes = d.used_bytes.saturating_add(size);
            d.free_bytes = d.free_bytes.saturating_sub(size);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Disk> {
        self.disks.get(name)
    }

    pub fn snapshot(&self) -> Vec<Disk> {
        let mut disks: Vec<_> = self.disks.values().cloned().collect();
        disks.sort_by(|a, b| a.name.cmp(&b.name));
        disks
    }
}

/// Terminal outcome of one move.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    Completed,
    /// The journal shows this exact move finished in a previous run
    AlreadyCompleted,
    PreValidationFailed(String),
    TransferFailed {
        severity: Severity,
        category: Category,
        detail: String,
        attempts: u32,
    },
    PostValidationFailed(String),
    Aborted,
}

impl MoveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::AlreadyCompleted)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::AlreadyCompleted => "already completed in a previous run".to_string(),
            Self::PreValidationFailed(e) => format!("pre-validation failed: {e}"),
            Self::TransferFailed {
                detail, attempts, ..
            } => format!("transfer failed after {} attempt(s): {detail}", attempts + 1),
            Self::PostValidationFailed(e) => format!("post-validation failed: {e}"),
            Self::Aborted => "aborted".to_string(),
        }
    }
}

/// Result of one move, as reported to the caller.
#[derive(Debug, Clone)]
pub struct MoveReport {
    pub index: usize,
    pub mv: Move,
    pub outcome: MoveOutcome,
    pub duration: Duration,
    pub op_id: Option<String>,
}

/// Whole-run execution result.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub reports: Vec<MoveReport>,
    pub bytes_moved: u64,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn completed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| {
                !r.outcome.is_success() && !matches!(r.outcome, MoveOutcome::Aborted)
            })
            .count()
    }

    pub fn aborted(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, MoveOutcome::Aborted))
            .count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} completed, {} failed, {} aborted, {} moved in {:.1?}",
            self.completed(),
            self.failed(),
            self.aborted(),
            format_bytes(self.bytes_moved),
            self.duration
        )
    }
}

/// Events emitted to the progress subscriber.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MoveStarted {
        index: usize,
        total: usize,
        mv: Move,
    },
    Progress {
        index: usize,
        progress: TransferProgress,
    },
    MoveFinished {
        index: usize,
        mv: Move,
        success: bool,
        detail: String,
    },
    Overall(OverallProgress),
}

/// Run-level progress snapshot, emitted after every move.
#[derive(Debug, Clone)]
pub struct OverallProgress {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub bytes_moved: u64,
    pub bytes_total: u64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

/// The transfer engine.
pub struct Engine {
    config: Arc<CoreConfig>,
    journal: TransferJournal,
    disks: Arc<Mutex<DiskTable>>,
    cancel: Arc<AtomicBool>,
    events_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl Engine {
    pub fn new(config: CoreConfig, journal: TransferJournal, disks: &[Disk]) -> Self {
        Self {
            config: Arc::new(config),
            journal,
            disks: Arc::new(Mutex::new(DiskTable::new(disks))),
            cancel: Arc::new(AtomicBool::new(false)),
            events_tx: None,
        }
    }

    /// Create an engine with an event subscriber channel.
    pub fn with_events(
        config: CoreConfig,
        journal: TransferJournal,
        disks: &[Disk],
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let mut engine = Self::new(config, journal, disks);
        engine.events_tx = Some(tx);
        (engine, rx)
    }

    /// Shared cancel flag; setting it stops new-move dispatch.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// The live disk accounting table.
    pub fn disk_table(&self) -> Arc<Mutex<DiskTable>> {
        self.disks.clone()
    }

    /// Resume orphaned transfers left by a previous run, oldest first.
    ///
    /// The tool skips already-transferred bytes, so re-running an interrupted
    /// move converges on the same end state as an uninterrupted one.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<MoveReport>, StateError> {
        let purged = self.journal.purge_completed(self.config.retention())?;
        if purged > 0 {
            info!(purged, "Purged expired journal records");
        }

        let orphans = self.journal.find_orphans()?;
        let total = orphans.len();
        let mut reports = Vec::new();
        for (i, record) in orphans.into_iter().enumerate() {
            let mv = match record.to_move() {
                Ok(mv) => mv,
                Err(e) => {
                    error!(op_id = %record.op_id, error = %e, "Journal record is not executable");
                    continue;
                }
            };
            info!(op_id = %record.op_id, unit = %mv.unit.share_path(), "Resuming orphaned move");
            let report = self.run_move(i, total, mv, Some(record)).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Execute a plan.
    ///
    /// Returns `Err` only on journal failures; per-move errors are captured
    /// in the result and never abort the run.
    #[instrument(skip(self, plan))]
    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionResult, StateError> {
        let start = Instant::now();
        let total = plan.moves.len();
        let bytes_total = plan.total_bytes();
        let mut result = ExecutionResult::default();

        if total == 0 {
            info!("No moves to execute");
            return Ok(result);
        }

        let pool = self.config.pool_size(plan.disks.len());
        info!(moves = total, pool, "Executing plan");

        // Re-running a plan with the journal intact must not redo work: a
        // move whose exact identity is already journaled as completed, and
        // whose source bytes are gone, is reported done without a transfer.
        let completed_before: HashSet<(String, String, String, String)> = self
            .journal
            .load_all()?
            .into_iter()
            .filter(|r| r.status == MoveStatus::Completed)
            .map(|r| (r.share, r.rel_path, r.src_disk, r.dest_disk))
            .collect();

        let mut pending: VecDeque<(usize, Move)> = VecDeque::new();
        for (index, mv) in plan.moves.iter().cloned().enumerate() {
            let key = (
                mv.unit.share.clone(),
                mv.unit.rel_path.clone(),
                mv.unit.src_disk.clone(),
                mv.dest_disk.clone(),
            );
            if completed_before.contains(&key)
                && !mv.unit.src_abs(&self.config.mount_prefix).exists()
            {
                info!(unit = %mv.unit.share_path(), "Move already completed, skipping");
                result.reports.push(MoveReport {
                    index,
                    mv,
                    outcome: MoveOutcome::AlreadyCompleted,
                    duration: Duration::ZERO,
                    op_id: None,
                });
                continue;
            }
            pending.push_back((index, mv));
        }
        let mut busy: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<Result<MoveReport, StateError>> = JoinSet::new();
        let mut fatal: Option<StateError> = None;

        loop {
            if self.cancel.load(Ordering::SeqCst) || fatal.is_some() {
                // Refuse new moves; drain whatever is in flight.
                while let Some((index, mv)) = pending.pop_front() {
                    result.reports.push(MoveReport {
                        index,
                        mv,
                        outcome: MoveOutcome::Aborted,
                        duration: Duration::ZERO,
                        op_id: None,
                    });
                }
            } else {
                // Dispatch every queued move whose disks are free, without
                // overtaking an earlier move that shares a disk.
                let mut blocked = busy.clone();
                let mut i = 0;
                while i < pending.len() && tasks.len() < pool {
                    let src = pending[i].1.src_disk().to_string();
                    let dest = pending[i].1.dest_disk.clone();
                    if !blocked.contains(&src) && !blocked.contains(&dest) {
                        let (index, mv) = pending.remove(i).expect("index in bounds");
                        busy.insert(src.clone());
                        busy.insert(dest.clone());
                        blocked.insert(src);
                        blocked.insert(dest);
                        let engine = self.clone_for_task();
                        tasks.spawn(async move { engine.run_move(index, total, mv, None).await });
                    } else {
                        blocked.insert(src);
                        blocked.insert(dest);
                        i += 1;
                    }
                }

                // Nothing running and nothing dispatchable: the remaining
                // moves are stuck behind disks a panicked task never
                // released. Abort them rather than spin.
                if tasks.is_empty() && !pending.is_empty() {
                    warn!(
                        stuck = pending.len(),
                        "Remaining moves blocked by unreleased disks, aborting them"
                    );
                    while let Some((index, mv)) = pending.pop_front() {
                        result.reports.push(MoveReport {
                            index,
                            mv,
                            outcome: MoveOutcome::Aborted,
                            duration: Duration::ZERO,
                            op_id: None,
                        });
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                if pending.is_empty() || self.cancel.load(Ordering::SeqCst) || fatal.is_some() {
                    break;
                }
                continue;
            };

            match joined {
                Ok(Ok(report)) => {
                    busy.remove(report.mv.src_disk());
                    busy.remove(&report.mv.dest_disk);
                    if report.outcome.is_success() {
                        result.bytes_moved += report.mv.size_bytes();
                    }
                    result.reports.push(report);
                    self.emit_overall(&result, total, bytes_total, start).await;
                }
                Ok(Err(state_err)) => {
                    error!(error = %state_err, "Journal failure, aborting run");
                    fatal = Some(state_err);
                }
                Err(join_err) => {
                    // A panicked task poisons nothing; its disks stay marked
                    // busy so nothing else touches them this run.
                    error!(error = %join_err, "Move task panicked");
                }
            }
        }

        result.duration = start.elapsed();
        if let Some(err) = fatal {
            return Err(err);
        }
        result.reports.sort_by_key(|r| r.index);
        info!(summary = %result.summary(), "Plan execution finished");
        Ok(result)
    }

    /// Run a single move end to end.
    async fn run_move(
        &self,
        index: usize,
        total: usize,
        mv: Move,
        resume: Option<TransferRecord>,
    ) -> Result<MoveReport, StateError> {
        let start = Instant::now();
        let resuming = resume.is_some();
        self.emit(EngineEvent::MoveStarted {
            index,
            total,
            mv: mv.clone(),
        })
        .await;

        // The journal write is the durability boundary: no record, no spawn.
        let mut record = match resume {
            Some(r) => r,
            None => self
                .journal
                .record_start(&mv, &self.config.mount_prefix)?,
        };

        // A resumed move legitimately finds a partial destination in place.
        let check_config = if resuming {
            let mut c = (*self.config).clone();
            c.allow_merge = true;
            std::borrow::Cow::Owned(c)
        } else {
            std::borrow::Cow::Borrowed(&*self.config)
        };

        if let Err(e) = pre_checks(&check_config, &mv) {
            warn!(unit = %mv.unit.share_path(), error = %e, "Move failed pre-validation");
            self.journal.update(&mut record, MoveStatus::Failed)?;
            return Ok(self.finish(index, mv, MoveOutcome::PreValidationFailed(e.to_string()), start, record.op_id).await);
        }

        let src = mv.unit.src_abs(&self.config.mount_prefix);
        let dest = mv.unit.dest_abs(&self.config.mount_prefix, &mv.dest_disk);
        let source_was_dir = src.is_dir();
        let invocation = RsyncInvocation::build(
            &self.config.rsync_path,
            self.config.rsync_mode,
            &self.config.rsync_extra,
            &src,
            &dest,
            source_was_dir,
        );

        let verdict = self
            .run_with_retries(index, &mv, &invocation, &mut record)
            .await?;

        if !verdict.is_success() {
            self.journal.update(&mut record, MoveStatus::Failed)?;
            let outcome = MoveOutcome::TransferFailed {
                severity: verdict.severity,
                category: verdict.category,
                detail: verdict.detail,
                attempts: record.attempts,
            };
            return Ok(self.finish(index, mv, outcome, start, record.op_id).await);
        }

        if source_was_dir {
            if let Err(e) = rsync::prune_empty_dirs(&src) {
                warn!(path = %src.display(), error = %e, "Could not prune source directories");
            }
        }

        if let Err(e) = post_checks(&self.config, &mv, source_was_dir, true) {
            error!(unit = %mv.unit.share_path(), error = %e, "Move failed post-validation");
            self.journal.update(&mut record, MoveStatus::Failed)?;
            return Ok(self.finish(index, mv, MoveOutcome::PostValidationFailed(e.to_string()), start, record.op_id).await);
        }

        self.disks
            .lock()
            .apply_move(mv.src_disk(), &mv.dest_disk, mv.size_bytes());
        self.journal.update(&mut record, MoveStatus::Completed)?;
        info!(
            unit = %mv.unit.share_path(),
            src = %mv.src_disk(),
            dest = %mv.dest_disk,
            size = %format_bytes(mv.size_bytes()),
            "Move completed"
        );
        Ok(self.finish(index, mv, MoveOutcome::Completed, start, record.op_id).await)
    }

    /// Drive the subprocess with the retry policy: exponential backoff for
    /// recoverable failures, a single extra attempt after a soft timeout.
    async fn run_with_retries(
        &self,
        index: usize,
        mv: &Move,
        invocation: &RsyncInvocation,
        record: &mut TransferRecord,
    ) -> Result<Verdict, StateError> {
        let mut attempt: u32 = 0;
        let mut timeout_retries: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = classify::retry_delay(attempt - 1);
                info!(
                    unit = %mv.unit.share_path(),
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "Retrying move"
                );
                tokio::time::sleep(delay).await;
                self.journal.bump_attempts(record)?;
            }

            let progress_tx = self.progress_forwarder(index);
            let outcome = match rsync::run(
                invocation,
                mv.size_bytes(),
                self.config.move_timeout(),
                progress_tx,
            )
            .await
            {
                Ok(o) => o,
                Err(e) => {
                    return Ok(Verdict {
                        severity: Severity::High,
                        category: Category::Unknown,
                        recoverable: false,
                        detail: e.to_string(),
                    });
                }
            };

            if outcome.timed_out {
                if timeout_retries < 1 {
                    warn!(unit = %mv.unit.share_path(), "Move timed out, retrying once");
                    timeout_retries += 1;
                    attempt += 1;
                    continue;
                }
                return Ok(Verdict {
                    severity: Severity::Medium,
                    category: Category::Transient,
                    recoverable: false,
                    detail: "move exceeded its soft timeout twice".to_string(),
                });
            }

            let verdict = classify::classify(outcome.exit_code, &outcome.stderr);
            if verdict.is_success() {
                return Ok(verdict);
            }
            if verdict.recoverable && attempt < self.config.max_retries {
                warn!(
                    unit = %mv.unit.share_path(),
                    exit_code = outcome.exit_code,
                    detail = %verdict.detail,
                    "Recoverable transfer failure"
                );
                attempt += 1;
                continue;
            }
            return Ok(verdict);
        }
    }

    /// Wire a per-move progress channel into the engine event stream.
    fn progress_forwarder(&self, index: usize) -> Option<mpsc::Sender<TransferProgress>> {
        let events = self.events_tx.clone()?;
        let (tx, mut rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let _ = events.send(EngineEvent::Progress { index, progress }).await;
            }
        });
        Some(tx)
    }

    async fn finish(
        &self,
        index: usize,
        mv: Move,
        outcome: MoveOutcome,
        start: Instant,
        op_id: String,
    ) -> MoveReport {
        self.emit(EngineEvent::MoveFinished {
            index,
            mv: mv.clone(),
            success: outcome.is_success(),
            detail: outcome.describe(),
        })
        .await;
        MoveReport {
            index,
            mv,
            outcome,
            duration: start.elapsed(),
            op_id: Some(op_id),
        }
    }

    async fn emit_overall(
        &self,
        result: &ExecutionResult,
        total: usize,
        bytes_total: u64,
        start: Instant,
    ) {
        let elapsed = start.elapsed();
        let eta = if result.bytes_moved > 0 && bytes_total > result.bytes_moved {
            let rate = result.bytes_moved as f64 / elapsed.as_secs_f64().max(0.001);
            Some(Duration::from_secs_f64(
                (bytes_total - result.bytes_moved) as f64 / rate,
            ))
        } else {
            None
        };
        self.emit(EngineEvent::Overall(OverallProgress {
            completed: result.completed(),
            failed: result.failed(),
            total,
            bytes_moved: result.bytes_moved,
            bytes_total,
            elapsed,
            eta,
        }))
        .await;
    }

    async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event).await;
        }
    }

    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            journal: self.journal.clone(),
            disks: self.disks.clone(),
            cancel: self.cancel.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}
