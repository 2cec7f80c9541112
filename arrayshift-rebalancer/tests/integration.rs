//! End-to-end tests for the rebalancer pipeline
//!
//! Builds a miniature array in a temp directory, runs discovery → scan →
//! plan → execute with a shell stand-in for rsync, and checks the resulting
//! filesystem and journal state.
//!
//! Run with: cargo test --test integration

use arrayshift_core::{Disk, Plan};
use arrayshift_rebalancer::engine::Engine;
use arrayshift_rebalancer::{
    build_plan, load_plan, save_plan, scan_units, CoreConfig, TransferJournal,
};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const GIB: u64 = 1024 * 1024 * 1024;

/// Shell stand-in for rsync with atomic-move semantics: copy into the
/// destination, then remove source files. Re-runnable on a partial
/// destination, like the real tool.
const STUB_TOOL: &str = r#"#!/bin/sh
eval "src=\${$(($#-1))}"
eval "dst=\${$#}"
case "$src" in
  */)
    base="${src%/}"
    mkdir -p "$dst"
    cp -R "$base/." "$dst/"
    find "$base" -type f -exec rm -f {} +
    ;;
  *)
    cp "$src" "$dst"
    rm -f "$src"
    ;;
esac
exit 0
"#;

struct TestArray {
    _tmp: TempDir,
    config: CoreConfig,
    /// Synthetic capacity figures driving the planner; mounts point at the
    /// real temp tree.
    disks: Vec<Disk>,
}

fn install_stub(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join("fake-rsync");
    fs::write(&path, STUB_TOOL).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Two-disk array: disk1 crowded with three movie units, disk2 nearly empty.
fn make_array() -> TestArray {
    let tmp = TempDir::new().unwrap();
    let prefix = tmp.path().join("mnt");

    for (disk, rel, kib) in [
        ("disk1", "Movies/Alien (1979)", 64u64),
        ("disk1", "Movies/Blade Runner", 32),
        ("disk1", "Movies/Coda", 16),
        ("disk2", "Movies/Dune", 8),
    ] {
        let dir = prefix.join(disk).join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("film.mkv"), vec![0xAB; (kib * 1024) as usize]).unwrap();
    }

    let tool = install_stub(&tmp.path().join("bin"));
    let config = CoreConfig {
        mount_prefix: prefix.clone(),
        state_dir: tmp.path().join("state"),
        rsync_path: tool.display().to_string(),
        min_unit_size: 1,
        ..Default::default()
    };

    // Capacity snapshot that makes disk1 a source: sizes are synthetic, the
    // subtrees are real.
    let disks = vec![
        Disk {
            name: "disk1".to_string(),
            mount: prefix.join("disk1"),
            size_bytes: 100 * GIB,
            used_bytes: 90 * GIB,
            free_bytes: 10 * GIB,
        },
        Disk {
            name: "disk2".to_string(),
            mount: prefix.join("disk2"),
            size_bytes: 100 * GIB,
            used_bytes: 10 * GIB,
            free_bytes: 90 * GIB,
        },
    ];

    TestArray {
        _tmp: tmp,
        config,
        disks,
    }
}

fn file_set(root: &Path) -> HashSet<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .to_string()
        })
        .collect()
}

#[test]
fn scan_then_plan_moves_only_scanned_units() {
    let array = make_array();
    let units = scan_units(&array.config, &array.disks).unwrap();
    assert_eq!(units.len(), 4);

    let outcome = build_plan(&array.config, &array.disks, &units).unwrap();
    assert!(!outcome.plan.moves.is_empty());

    // Every planned move references a scanned unit, sources only shed, and
    // no move is a self-move.
    let scanned: HashSet<_> = units
        .iter()
        .map(|u| (u.src_disk.clone(), u.share_path()))
        .collect();
    for m in &outcome.plan.moves {
        assert!(scanned.contains(&(m.src_disk().to_string(), m.unit.share_path())));
        assert_eq!(m.src_disk(), "disk1");
        assert_eq!(m.dest_disk, "disk2");
    }
}

#[tokio::test]
async fn full_pipeline_moves_data_and_preserves_every_byte() {
    let array = make_array();
    let units = scan_units(&array.config, &array.disks).unwrap();
    let outcome = build_plan(&array.config, &array.disks, &units).unwrap();

    let before = file_set(&array.config.mount_prefix);

    let journal = TransferJournal::open(&array.config.state_dir).unwrap();
    let engine = Engine::new(array.config.clone(), journal.clone(), &array.disks);
    let result = engine.execute(&outcome.plan).await.unwrap();

    assert_eq!(result.failed(), 0);
    assert_eq!(result.completed(), outcome.plan.moves.len());

    // Every file is still present exactly once, just under another disk.
    let after = file_set(&array.config.mount_prefix);
    let strip_disk = |set: &HashSet<String>| -> Vec<String> {
        let mut v: Vec<String> = set
            .iter()
            .map(|p| p.splitn(2, '/').nth(1).unwrap().to_string())
            .collect();
        v.sort();
        v
    };
    assert_eq!(strip_disk(&before), strip_disk(&after));

    // Moved units landed on disk2 and left disk1.
    for m in &outcome.plan.moves {
        let dest = m.unit.dest_abs(&array.config.mount_prefix, &m.dest_disk);
        assert!(dest.join("film.mkv").is_file(), "missing {}", dest.display());
        assert!(!m.unit.src_abs(&array.config.mount_prefix).exists());
    }
}

#[tokio::test]
async fn rerunning_a_finished_plan_is_a_no_op() {
    let array = make_array();
    let units = scan_units(&array.config, &array.disks).unwrap();
    let outcome = build_plan(&array.config, &array.disks, &units).unwrap();

    let journal = TransferJournal::open(&array.config.state_dir).unwrap();
    let engine = Engine::new(array.config.clone(), journal.clone(), &array.disks);
    let first = engine.execute(&outcome.plan).await.unwrap();
    assert_eq!(first.failed(), 0);
    let after_first = file_set(&array.config.mount_prefix);
    let records_after_first = journal.load_all().unwrap().len();

    // Same plan, journal intact: nothing moves again, nothing fails.
    let engine = Engine::new(array.config.clone(), journal.clone(), &array.disks);
    let second = engine.execute(&outcome.plan).await.unwrap();

    assert_eq!(second.failed(), 0);
    assert_eq!(second.bytes_moved, 0);
    assert_eq!(file_set(&array.config.mount_prefix), after_first);
    assert_eq!(journal.load_all().unwrap().len(), records_after_first);
}

#[tokio::test]
async fn saved_plan_loads_and_executes_identically() {
    let array = make_array();
    let units = scan_units(&array.config, &array.disks).unwrap();
    let outcome = build_plan(&array.config, &array.disks, &units).unwrap();

    let plan_path = array.config.state_dir.join("plan.json");
    fs::create_dir_all(&array.config.state_dir).unwrap();
    save_plan(&outcome.plan, &plan_path).unwrap();
    let loaded: Plan = load_plan(&plan_path, &array.config.mount_prefix).unwrap();
    assert_eq!(loaded, outcome.plan);

    let journal = TransferJournal::open(&array.config.state_dir).unwrap();
    let engine = Engine::new(array.config.clone(), journal, &array.disks);
    let result = engine.execute(&loaded).await.unwrap();
    assert_eq!(result.failed(), 0);
    assert_eq!(result.completed(), loaded.moves.len());
}

#[tokio::test]
async fn interrupted_move_resumes_to_a_clean_state() {
    let array = make_array();
    let prefix = &array.config.mount_prefix;

    let units = scan_units(&array.config, &array.disks).unwrap();
    let outcome = build_plan(&array.config, &array.disks, &units).unwrap();
    let mv = outcome.plan.moves[0].clone();

    // Simulate a crash mid-move: journal says in-flight, destination holds a
    // partial copy, source still has everything, owner pid is dead.
    let journal = TransferJournal::open(&array.config.state_dir).unwrap();
    let mut record = journal.record_start(&mv, prefix).unwrap();
    let partial_dest = mv.unit.dest_abs(prefix, &mv.dest_disk);
    fs::create_dir_all(&partial_dest).unwrap();
    // --inplace writes into the final filename, so the partial copy sits at
    // the destination path itself.
    fs::write(partial_dest.join("film.mkv"), b"half").unwrap();
    record.pid = {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    };
    journal
        .update(&mut record, arrayshift_core::MoveStatus::InFlight)
        .unwrap();

    // Restarting the engine resumes the orphan before any new work.
    let engine = Engine::new(array.config.clone(), journal.clone(), &array.disks);
    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].outcome.is_success());

    // The unit now lives on the destination only.
    assert!(partial_dest.join("film.mkv").is_file());
    assert!(!mv.unit.src_abs(prefix).exists());

    // And the journal reflects a completed transfer for it.
    let statuses: Vec<_> = journal
        .load_all()
        .unwrap()
        .into_iter()
        .filter(|r| r.rel_path == mv.unit.rel_path)
        .map(|r| r.status)
        .collect();
    assert!(statuses
        .iter()
        .any(|s| *s == arrayshift_core::MoveStatus::Completed));
}

#[test]
fn scan_output_is_stable_across_runs() {
    let array = make_array();
    let first = scan_units(&array.config, &array.disks).unwrap();
    let second = scan_units(&array.config, &array.disks).unwrap();
    assert_eq!(first, second);

    let plan_a = build_plan(&array.config, &array.disks, &first).unwrap();
    let plan_b = build_plan(&array.config, &array.disks, &second).unwrap();
    assert_eq!(plan_a.plan, plan_b.plan);
}
