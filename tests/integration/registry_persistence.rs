//! Restart round-trips of the persistent registry.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use yggdrasil::{
    BranchName, Hlc, RegistryEntry, Result, SnapshotRegistry, SystemId, Workspace,
    WorkspaceOptions,
};

const SYSTEMS: [&str; 3] = ["alpha", "beta", "gamma"];
const BRANCHES: [&str; 4] = ["main", "develop", "release", "hotfix"];

fn seeded_entries(count: u64) -> Vec<RegistryEntry> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut entries = Vec::with_capacity(count as usize);
    for n in 0..count {
        let system = SYSTEMS[rng.gen_range(0..SYSTEMS.len())];
        let branch = BRANCHES[rng.gen_range(0..BRANCHES.len())];
        let mut entry = RegistryEntry::new(
            format!("{system}-{branch}-s{n}"),
            system,
            branch,
            // Scrambled logical components exercise ordering inside a
            // millisecond as well.
            Hlc::new(1_000_000 + n / 4, (n % 4) as u32),
        );
        entry
            .metadata
            .insert("message".to_string(), format!("commit {n}"));
        if n % 7 == 0 {
            entry.content_hash = Some(format!("hash-{n}"));
        }
        entries.push(entry);
    }
    entries
}

#[test]
fn five_thousand_entries_survive_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry");
    let entries = seeded_entries(5000);

    let mut histories_before = Vec::new();
    let mut world_before = None;
    let probe_hlc = Hlc::new(1_000_700, 2);
    {
        let workspace = Workspace::open(WorkspaceOptions::persistent(&path))?;
        workspace.registry().register_batch(entries.clone())?;

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..20 {
            let system = SystemId::from(SYSTEMS[rng.gen_range(0..SYSTEMS.len())]);
            let branch = BranchName::from(BRANCHES[rng.gen_range(0..BRANCHES.len())]);
            let history =
                workspace
                    .registry()
                    .system_history(&system, &branch, Some(25), None)?;
            histories_before.push((system, branch, history));
        }
        world_before = Some(workspace.as_of_world(probe_hlc)?);
        workspace.close()?;
    }

    let reopened = SnapshotRegistry::open(&path)?;
    assert_eq!(reopened.entry_count()?, 5000);

    for (system, branch, before) in &histories_before {
        let after = reopened.system_history(system, branch, Some(25), None)?;
        assert_eq!(&after, before, "history for {system}/{branch} changed");
    }

    let world_after = reopened.as_of(probe_hlc)?;
    assert_eq!(world_after, world_before.unwrap());
    Ok(())
}

#[test]
fn reopen_sees_the_same_multiset_after_incremental_flushes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry");
    let entries = seeded_entries(600);
    {
        let registry = SnapshotRegistry::open(&path)?;
        for chunk in entries.chunks(100) {
            registry.register_batch(chunk.to_vec())?;
            registry.flush()?;
        }
        registry.close()?;
    }
    let reopened = SnapshotRegistry::open(&path)?;
    let mut before = entries;
    before.sort_by_key(|e| e.key());
    let after = reopened.all_entries()?;
    assert_eq!(after, before);
    Ok(())
}

#[test]
fn unflushed_mutations_do_not_survive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry");
    {
        let registry = SnapshotRegistry::open(&path)?;
        registry.register(RegistryEntry::new("kept", "sys", "main", Hlc::new(1, 0)))?;
        registry.flush()?;
        registry.register(RegistryEntry::new("lost", "sys", "main", Hlc::new(2, 0)))?;
        // Dropped without flush or close.
    }
    let reopened = SnapshotRegistry::open(&path)?;
    assert_eq!(reopened.entry_count()?, 1);
    assert_eq!(reopened.all_entries()?[0].snapshot_id.as_str(), "kept");
    Ok(())
}

#[test]
fn lazy_open_touches_only_the_root_until_queried() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("registry");
    {
        let registry = SnapshotRegistry::open(&path)?;
        registry.register_batch(seeded_entries(1000))?;
        registry.close()?;
    }
    let reopened = SnapshotRegistry::open(&path)?;
    assert_eq!(reopened.index_metrics().loads, 0, "open is lazy");
    let _ = reopened.all_entries()?;
    assert!(reopened.index_metrics().loads > 0, "queries materialize");
    Ok(())
}
