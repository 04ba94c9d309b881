//! Overlay sessions and multi-system composition helpers.

mod common;

use common::MemoryBackend;
use yggdrasil::capability::{Backend, OverlayMode, OverlayOptions};
use yggdrasil::compose;
use yggdrasil::{BackendHandle, Result, SystemId};

#[test]
fn frozen_overlay_ignores_parent_updates() -> Result<()> {
    let backend = MemoryBackend::create("frozen");
    let base = backend.commit("base", &[("k", "0")])?;
    let probe = backend.overlay_probe(OverlayMode::Frozen);
    let overlay = probe.handle();

    backend.commit("parent moves on", &[("k", "1")])?;
    assert_eq!(overlay.base_ref()?, Some(base));
    assert_ne!(overlay.peek_parent()?, overlay.base_ref()?);
    // Frozen overlays do not move on advance either.
    let after = overlay.advance()?;
    assert_eq!(after, overlay.base_ref()?);
    Ok(())
}

#[test]
fn following_overlay_tracks_the_parent() -> Result<()> {
    let backend = MemoryBackend::create("following");
    backend.commit("base", &[("k", "0")])?;
    let probe = backend.overlay_probe(OverlayMode::Following);
    let overlay = probe.handle();

    let next = backend.commit("update", &[("k", "1")])?;
    assert_eq!(overlay.base_ref()?, Some(next));
    Ok(())
}

#[test]
fn gated_overlay_moves_only_at_advance() -> Result<()> {
    let backend = MemoryBackend::create("gated");
    let base = backend.commit("base", &[("k", "0")])?;
    let probe = backend.overlay_probe(OverlayMode::Gated);
    let overlay = probe.handle();

    let next = backend.commit("update", &[("k", "1")])?;
    assert_eq!(overlay.base_ref()?, Some(base.clone()));
    assert_eq!(overlay.peek_parent()?, Some(next.clone()));

    let advanced = overlay.advance()?;
    assert_eq!(advanced, Some(next.clone()));
    assert_eq!(overlay.base_ref()?, Some(next));
    Ok(())
}

#[test]
fn overlay_writes_shadow_and_merge_down() -> Result<()> {
    let backend = MemoryBackend::create("shadowed");
    backend.commit("base", &[("k", "base")])?;
    let probe = backend.overlay_probe(OverlayMode::Frozen);
    probe.write("k", "shadow");
    probe.write("extra", "1");

    let overlay = probe.handle();
    let mut writes = overlay.overlay_writes()?;
    writes.sort();
    assert_eq!(writes, vec!["extra".to_string(), "k".to_string()]);
    // Parent unchanged until merge-down.
    assert_eq!(backend.read("k").as_deref(), Some("base"));

    let merged = overlay.merge_down()?.expect("merge produces a snapshot");
    assert_eq!(backend.read("k").as_deref(), Some("shadow"));
    assert_eq!(backend.read("extra").as_deref(), Some("1"));
    assert!(backend.has_snapshot(&merged));
    Ok(())
}

#[test]
fn prepare_all_forks_every_system() -> Result<()> {
    let a = MemoryBackend::create("prep-a");
    let b = MemoryBackend::create("prep-b");
    a.commit("seed", &[("k", "a")])?;
    b.commit("seed", &[("k", "b")])?;
    let backends: Vec<BackendHandle> = vec![a.clone(), b.clone()];

    let overlays = compose::prepare_all(&backends, &OverlayOptions::default())?;
    assert_eq!(overlays.len(), 2);
    assert!(overlays.contains_key(&SystemId::from("prep-a")));
    assert!(overlays.contains_key(&SystemId::from("prep-b")));
    compose::discard_all(&overlays.into_values().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn commit_seq_discards_from_the_first_failure() -> Result<()> {
    let a = MemoryBackend::create("seq-a");
    let b = MemoryBackend::create("seq-b");
    let c = MemoryBackend::create("seq-c");
    for backend in [&a, &b, &c] {
        backend.commit("seed", &[("k", "0")])?;
    }
    let ok = a.overlay_probe(OverlayMode::Frozen);
    ok.write("k", "1");
    let failing = b.overlay_probe(OverlayMode::Frozen);
    failing.write("k", "1");
    failing.fail_merges();
    let never_reached = c.overlay_probe(OverlayMode::Frozen);
    never_reached.write("k", "1");

    let outcome = compose::commit_seq(&[ok.handle(), failing.handle(), never_reached.handle()]);
    assert_eq!(outcome.committed.len(), 1);
    assert_eq!(outcome.committed[0].0, SystemId::from("seq-a"));
    assert_eq!(outcome.failed, Some(SystemId::from("seq-b")));
    assert_eq!(
        outcome.discarded,
        vec![SystemId::from("seq-b"), SystemId::from("seq-c")]
    );
    assert!(outcome.error.is_some());

    // The first overlay landed; the untouched one was discarded unmerged.
    assert_eq!(a.read("k").as_deref(), Some("1"));
    assert_eq!(c.read("k").as_deref(), Some("0"));
    assert!(never_reached.is_discarded());
    Ok(())
}

#[test]
fn snapshot_refs_capture_a_cross_system_checkpoint() -> Result<()> {
    let a = MemoryBackend::create("check-a");
    let b = MemoryBackend::create("check-b");
    let head_a = a.commit("seed", &[("k", "a")])?;
    let backends: Vec<BackendHandle> = vec![a.clone(), b.clone()];

    let refs = compose::snapshot_refs(&backends)?;
    assert_eq!(refs.len(), 2);
    let for_a = refs
        .iter()
        .find(|r| r.system_id == SystemId::from("check-a"))
        .unwrap();
    assert_eq!(for_a.snapshot_id.as_ref(), Some(&head_a));
    let for_b = refs
        .iter()
        .find(|r| r.system_id == SystemId::from("check-b"))
        .unwrap();
    assert_eq!(for_b.snapshot_id, None, "empty system checkpoints as None");
    assert_eq!(for_a.system_type, b.system_type());
    Ok(())
}
