//! Coordinated GC: reachability, grace, conservative delegation, held refs.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::MemoryBackend;
use yggdrasil::{GcOptions, Result, SnapshotId, SystemId, Workspace};

/// Everything eligible immediately; freed index nodes too.
fn eager() -> GcOptions {
    GcOptions {
        grace_period_ms: 0,
        freed_grace_period_ms: 0,
        dry_run: false,
    }
}

/// Commits a chain of two snapshots, strands it with a head reset, then
/// commits a fresh root. Returns (stranded, head).
fn strand_history(
    workspace: &Workspace,
    backend: &Arc<MemoryBackend>,
    system: &str,
) -> Result<(Vec<SnapshotId>, SnapshotId)> {
    let system_id = SystemId::from(system);
    let mut stranded = Vec::new();
    for n in 0..2 {
        let hlc = workspace.begin_transaction();
        let committer = Arc::clone(backend);
        let entry = workspace.commit_with_hlc(&system_id, hlc, move |_| {
            committer.commit("stranded", &[("n", &n.to_string())])
        })?;
        stranded.push(entry.snapshot_id);
    }
    backend.reset_head(None);
    let hlc = workspace.begin_transaction();
    let committer = Arc::clone(backend);
    let head = workspace
        .commit_with_hlc(&system_id, hlc, move |_| {
            committer.commit("fresh root", &[("n", "root")])
        })?
        .snapshot_id;
    // Let the stranded stamps age past the zero grace period.
    thread::sleep(Duration::from_millis(5));
    Ok((stranded, head))
}

#[test]
fn sweep_removes_stranded_aged_entries() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("sweepable");
    workspace.add_system(backend.clone())?;
    let (stranded, head) = strand_history(&workspace, &backend, "sweepable")?;

    let outcome = workspace.gc_sweep(&eager())?;
    assert!(outcome.errors.is_empty());
    assert!(outcome.reachable.contains(&head));
    let swept: Vec<&SnapshotId> = outcome.swept.iter().map(|e| &e.snapshot_id).collect();
    for snapshot in &stranded {
        assert!(swept.contains(&snapshot), "{snapshot} should be swept");
        assert!(!backend.has_snapshot(snapshot), "backend deleted {snapshot}");
        assert!(workspace.registry().snapshot_refs(snapshot)?.is_empty());
    }
    assert!(backend.has_snapshot(&head));
    assert!(!workspace.registry().snapshot_refs(&head)?.is_empty());
    Ok(())
}

#[test]
fn grace_period_retains_recent_strays() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("graced");
    workspace.add_system(backend.clone())?;
    let (stranded, _) = strand_history(&workspace, &backend, "graced")?;

    let outcome = workspace.gc_sweep(&GcOptions::default())?;
    assert!(outcome.swept.is_empty(), "defaults keep a week of history");
    assert!(outcome.candidates.is_empty());
    for snapshot in &stranded {
        assert!(backend.has_snapshot(snapshot));
    }
    Ok(())
}

#[test]
fn dry_run_reports_candidates_without_deleting() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("rehearsal");
    workspace.add_system(backend.clone())?;
    let (stranded, _) = strand_history(&workspace, &backend, "rehearsal")?;

    let outcome = workspace.gc_sweep(&GcOptions {
        dry_run: true,
        ..eager()
    })?;
    assert!(outcome.swept.is_empty());
    assert_eq!(outcome.freed_nodes_swept, 0);
    assert_eq!(outcome.candidates.len(), stranded.len());
    for snapshot in &stranded {
        assert!(backend.has_snapshot(snapshot));
        assert!(!workspace.registry().snapshot_refs(snapshot)?.is_empty());
    }
    Ok(())
}

#[test]
fn failed_backend_sweep_is_conservative() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("refusing");
    workspace.add_system(backend.clone())?;
    let (stranded, head) = strand_history(&workspace, &backend, "refusing")?;
    backend.fail_sweeps();

    let outcome = workspace.gc_sweep(&eager())?;
    assert!(outcome.errors.contains_key(&SystemId::from("refusing")));
    assert!(outcome.swept.is_empty());
    // Nothing deregistered, nothing deleted natively.
    for snapshot in stranded.iter().chain(std::iter::once(&head)) {
        assert!(backend.has_snapshot(snapshot));
        assert!(!workspace.registry().snapshot_refs(snapshot)?.is_empty());
    }
    Ok(())
}

#[test]
fn held_refs_pin_snapshots_until_release() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("pinned");
    workspace.add_system(backend.clone())?;

    // Commit the snapshot to pin, hold it, then strand it behind a fresh root.
    let system_id = SystemId::from("pinned");
    let hlc = workspace.begin_transaction();
    let committer = Arc::clone(&backend);
    let held_snapshot = workspace
        .commit_with_hlc(&system_id, hlc, move |_| {
            committer.commit("precious", &[("k", "v")])
        })?
        .snapshot_id;
    workspace.hold_ref("pinned/main", backend.clone())?;

    backend.reset_head(None);
    let hlc = workspace.begin_transaction();
    let committer = Arc::clone(&backend);
    workspace.commit_with_hlc(&system_id, hlc, move |_| {
        committer.commit("new root", &[("k", "w")])
    })?;
    thread::sleep(Duration::from_millis(5));

    let outcome = workspace.gc_sweep(&eager())?;
    assert!(outcome.errors.is_empty());
    assert!(
        outcome.reachable.contains(&held_snapshot),
        "held ref contributes its snapshot as a root"
    );
    assert!(!outcome
        .swept
        .iter()
        .any(|entry| entry.snapshot_id == held_snapshot));
    assert!(backend.has_snapshot(&held_snapshot));
    assert!(!workspace.registry().snapshot_refs(&held_snapshot)?.is_empty());

    // Releasing the ref resumes eligibility.
    workspace.release_ref("pinned/main")?;
    thread::sleep(Duration::from_millis(5));
    let outcome = workspace.gc_sweep(&eager())?;
    assert!(outcome
        .swept
        .iter()
        .any(|entry| entry.snapshot_id == held_snapshot));
    assert!(!backend.has_snapshot(&held_snapshot));
    Ok(())
}

#[test]
fn freed_index_nodes_are_reclaimed_after_their_grace() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("churny");
    workspace.add_system(backend.clone())?;
    strand_history(&workspace, &backend, "churny")?;

    // First sweep ends with a flush, putting the tree root on disk.
    let first = workspace.gc_sweep(&eager())?;
    assert!(first.errors.is_empty());

    // Mutating the flushed tree supersedes the persisted root.
    let hlc = workspace.begin_transaction();
    let committer = Arc::clone(&backend);
    workspace.commit_with_hlc(&SystemId::from("churny"), hlc, move |_| {
        committer.commit("more", &[("k", "v")])
    })?;
    workspace.registry().flush()?;
    thread::sleep(Duration::from_millis(10));

    // By the next run the superseded nodes are older than the zero grace.
    let second = workspace.gc_sweep(&eager())?;
    assert!(
        second.freed_nodes_swept > 0,
        "superseded index nodes reclaimed"
    );
    Ok(())
}

#[test]
fn empty_workspace_sweep_is_a_no_op() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let outcome = workspace.gc_sweep(&eager())?;
    assert!(outcome.swept.is_empty());
    assert!(outcome.candidates.is_empty());
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.freed_nodes_swept, 0);
    Ok(())
}

#[test]
fn report_groups_candidates_by_system() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let a = MemoryBackend::create("report-a");
    let b = MemoryBackend::create("report-b");
    workspace.add_system(a.clone())?;
    workspace.add_system(b.clone())?;
    let (stranded_a, _) = strand_history(&workspace, &a, "report-a")?;
    let (stranded_b, _) = strand_history(&workspace, &b, "report-b")?;

    let report = workspace.gc_report(&eager())?;
    assert_eq!(report.gc_eligible, stranded_a.len() + stranded_b.len());
    assert_eq!(report.by_system[&SystemId::from("report-a")], 2);
    assert_eq!(report.by_system[&SystemId::from("report-b")], 2);
    assert_eq!(report.total_entries, 6);
    // Reporting deletes nothing.
    for snapshot in stranded_a.iter().chain(&stranded_b) {
        assert!(!workspace.registry().snapshot_refs(snapshot)?.is_empty());
    }
    Ok(())
}
