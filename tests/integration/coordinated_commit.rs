//! Coordinated multi-system commits: pinned stamps and partial failure.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::MemoryBackend;
use yggdrasil::capability::Backend;
use yggdrasil::{
    BranchName, CommitFn, Result, SnapshotId, SystemId, Workspace, YggdrasilError,
};

#[test]
fn partial_failure_registers_only_the_successes() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let a = MemoryBackend::create("backend-a");
    let b = MemoryBackend::create("backend-b");
    workspace.add_system(a.clone())?;
    workspace.add_system(b.clone())?;

    let mut fns: BTreeMap<SystemId, CommitFn> = BTreeMap::new();
    let committer = Arc::clone(&a);
    fns.insert(
        SystemId::from("backend-a"),
        Box::new(move |_| committer.commit("write", &[("k", "v")])),
    );
    fns.insert(
        SystemId::from("backend-b"),
        Box::new(|_| Err(YggdrasilError::Backend("disk full".into()))),
    );

    let outcome = workspace.coordinated_commit(fns);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors.contains_key(&SystemId::from("backend-b")));

    let entry = &outcome.results[&SystemId::from("backend-a")];
    assert_eq!(entry.hlc, outcome.hlc);

    // The pinned stamp reflects A but knows nothing of B.
    let world = workspace.as_of_world(outcome.hlc)?;
    assert!(world.contains_key(&(SystemId::from("backend-a"), BranchName::default())));
    assert!(!world.contains_key(&(SystemId::from("backend-b"), BranchName::default())));
    Ok(())
}

#[test]
fn successes_share_the_pin_and_differ_by_system() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backends: Vec<_> = (0..3)
        .map(|n| MemoryBackend::create(&format!("sys-{n}")))
        .collect();
    let mut fns: BTreeMap<SystemId, CommitFn> = BTreeMap::new();
    for backend in &backends {
        workspace.add_system(backend.clone())?;
        let committer = Arc::clone(backend);
        fns.insert(
            backend.system_id(),
            Box::new(move |_| committer.commit("step", &[("x", "1")])),
        );
    }

    let outcome = workspace.coordinated_commit(fns);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.results.len(), 3);
    let entries: Vec<_> = outcome.results.values().collect();
    for entry in &entries {
        assert_eq!(entry.hlc, outcome.hlc, "every sub-commit shares the pin");
    }
    for (i, left) in entries.iter().enumerate() {
        for right in &entries[i + 1..] {
            assert_ne!(left.system_id, right.system_id);
        }
    }

    // The pinned stamp names a world that reflects all of them at once.
    let world = workspace.as_of_world(outcome.hlc)?;
    assert_eq!(world.len(), 3);
    Ok(())
}

#[test]
fn commit_entries_record_the_pre_commit_parent() -> Result<()> {
    let workspace = Workspace::in_memory()?;
    let backend = MemoryBackend::create("lineage");
    let first = backend.commit("base", &[("k", "0")])?;
    workspace.add_system(backend.clone())?;

    let pinned = workspace.begin_transaction();
    let committer = Arc::clone(&backend);
    let entry = workspace.commit_with_hlc(&SystemId::from("lineage"), pinned, move |_| {
        committer.commit("next", &[("k", "1")])
    })?;
    assert_eq!(entry.hlc, pinned);
    assert_eq!(
        entry.parent_ids.iter().collect::<Vec<&SnapshotId>>(),
        vec![&first]
    );
    Ok(())
}
