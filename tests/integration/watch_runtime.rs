//! Watch runtime and hook-driven registration end to end.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::MemoryBackend;
use yggdrasil::capability::{Snapshotable, WatchId};
use yggdrasil::watch::{PollFn, PollOutcome, WatcherState};
use yggdrasil::{BranchName, Result, SnapshotId, SystemId, WatchEvent, Workspace};

fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Poll function diffing the backend head against the last observed one.
fn head_poll(backend: Arc<MemoryBackend>) -> PollFn {
    Arc::new(move |last| {
        let previous = last
            .and_then(|state| state.downcast_ref::<Option<SnapshotId>>())
            .cloned()
            .flatten();
        let current = backend.snapshot_id()?;
        let events = match (&previous, &current) {
            (old, Some(new)) if old.as_ref() != Some(new) => vec![WatchEvent::Commit {
                snapshot_id: Some(new.clone()),
                branch: Some(BranchName::default()),
                timestamp_ms: 0,
            }],
            _ => Vec::new(),
        };
        Ok(PollOutcome {
            state: Box::new(current),
            events,
        })
    })
}

#[test]
fn polling_observes_backend_commits() -> Result<()> {
    let backend = MemoryBackend::create("polled");
    let state = WatcherState::new(SystemId::from("polled"));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    state.add_callback(
        WatchId(1),
        Arc::new(move |event| {
            assert!(event.is_commit());
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    state.start_polling(head_poll(Arc::clone(&backend)), 10);

    backend.commit("first", &[("k", "1")])?;
    wait_until(5000, || seen.load(Ordering::SeqCst) >= 1);

    backend.commit("second", &[("k", "2")])?;
    wait_until(5000, || seen.load(Ordering::SeqCst) >= 2);

    state.stop_polling();
    Ok(())
}

#[test]
fn quiet_backend_produces_no_events() -> Result<()> {
    let backend = MemoryBackend::create("quiet");
    backend.commit("only", &[("k", "v")])?;
    let state = WatcherState::new(SystemId::from("quiet"));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    state.add_callback(
        WatchId(1),
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    state.start_polling(head_poll(Arc::clone(&backend)), 10);

    // The first cycle reports the existing head once; after that, silence.
    wait_until(5000, || seen.load(Ordering::SeqCst) >= 1);
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    state.stop_polling();
    Ok(())
}

#[test]
fn managed_workspace_registers_watched_commits() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("native");
    workspace.manage(backend.clone())?;

    let c1 = backend.commit("one", &[("k", "1")])?;
    let c2 = backend.commit("two", &[("k", "2")])?;

    // The memory backend notifies synchronously, so the registry is current.
    let history = workspace.registry().system_history(
        &SystemId::from("native"),
        &BranchName::default(),
        None,
        None,
    )?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].snapshot_id, c2);
    assert_eq!(history[1].snapshot_id, c1);
    assert!(history[1].hlc < history[0].hlc);

    // Branch events pass through the hook filter without registering.
    use yggdrasil::capability::Branchable;
    backend.branch(&BranchName::from("feature"), None)?;
    assert_eq!(
        workspace
            .registry()
            .system_history(
                &SystemId::from("native"),
                &BranchName::default(),
                None,
                None
            )?
            .len(),
        2
    );

    workspace.close()?;
    let c3 = backend.commit("after close", &[("k", "3")])?;
    assert!(workspace
        .registry()
        .snapshot_refs(&c3)?
        .is_empty(), "hooks removed at close");
    Ok(())
}

#[test]
fn duplicate_events_are_tolerated() -> Result<()> {
    // At-least-once delivery: a re-registered commit replaces its entry
    // instead of duplicating it.
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("dupes");
    workspace.manage(backend.clone())?;
    let snapshot = backend.commit("once", &[("k", "v")])?;

    let before = workspace
        .registry()
        .snapshot_refs(&snapshot)?;
    assert_eq!(before.len(), 1);

    // Replay the same registration the way a duplicate event would.
    workspace.registry().register(before[0].clone())?;
    assert_eq!(workspace.registry().snapshot_refs(&snapshot)?.len(), 1);
    Ok(())
}
