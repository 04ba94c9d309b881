//! Coordinated garbage collection.
//!
//! The coordinator runs a mark-retain-sweep over every managed backend:
//! reachability is the union of backend-reported roots, per-branch ancestor
//! walks, and the workspace's held-ref contributions; unreachable entries
//! must also outlive a wall-clock grace period before they become
//! candidates. Deletion is delegated per system and failures are
//! conservative: a failed sweep leaves that system's entries registered.
//! A final pass reclaims index nodes that were freed long enough ago.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hlc::{wall_clock_ms, Hlc};
use crate::model::{RegistryEntry, SnapshotId, SystemId};
use crate::workspace::Workspace;

/// Tunables for one GC run.
#[derive(Clone, Copy, Debug)]
pub struct GcOptions {
    /// Minimum age of an unreachable entry before it may be swept.
    pub grace_period_ms: u64,
    /// Minimum age of a freed index node before it is physically deleted.
    pub freed_grace_period_ms: u64,
    /// Compute candidates but delete nothing.
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            grace_period_ms: 7 * 24 * 60 * 60 * 1000,
            freed_grace_period_ms: 60 * 60 * 1000,
            dry_run: false,
        }
    }
}

impl GcOptions {
    /// Same retention windows, but deleting nothing.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }
}

/// Outcome of [`Workspace::gc_sweep`].
#[derive(Debug, Serialize)]
pub struct GcSweepOutcome {
    /// Entries deregistered after their backend confirmed deletion.
    pub swept: Vec<RegistryEntry>,
    /// Entries that were eligible when the run started.
    pub candidates: Vec<RegistryEntry>,
    /// The reachable set the run retained.
    pub reachable: BTreeSet<SnapshotId>,
    /// Sweep failure per system; those entries stay registered.
    pub errors: BTreeMap<SystemId, String>,
    /// Index nodes physically reclaimed by the freed-node pass.
    pub freed_nodes_swept: usize,
}

/// Outcome of [`Workspace::gc_report`]: the mark and retain steps with no
/// deletion at all.
#[derive(Debug, Serialize)]
pub struct GcReport {
    /// The reachable set.
    pub reachable: BTreeSet<SnapshotId>,
    /// Entries that a sweep would hand to their backends.
    pub candidates: Vec<RegistryEntry>,
    /// Candidate count per system.
    pub by_system: BTreeMap<SystemId, usize>,
    /// Registered entries in total.
    pub total_entries: usize,
    /// Number of candidates.
    pub gc_eligible: usize,
}

impl Workspace {
    /// Union of every backend's live roots.
    ///
    /// Backends are snapshotted once at the start of the walk and checkout
    /// handles stay local, so the walk never writes back into the workspace.
    /// A read failure aborts the run: sweeping with partial reachability
    /// could delete snapshots another backend still roots.
    fn gc_reachable(&self) -> Result<BTreeSet<SnapshotId>> {
        let systems: Vec<_> = self.systems.read().values().cloned().collect();
        let mut reachable = BTreeSet::new();
        for backend in &systems {
            if let Some(collectable) = backend.as_garbage_collectable() {
                reachable.extend(collectable.gc_roots()?);
            } else if let Some(snapshotable) = backend.as_snapshotable() {
                if let Some(id) = snapshotable.snapshot_id()? {
                    reachable.insert(id);
                }
            }
            let (Some(branchable), Some(_)) = (backend.as_branchable(), backend.as_graphable())
            else {
                continue;
            };
            for branch in branchable.branches()? {
                let handle = branchable.checkout(&branch)?;
                let Some(snapshotable) = handle.as_snapshotable() else {
                    continue;
                };
                let Some(head) = snapshotable.snapshot_id()? else {
                    continue;
                };
                reachable.insert(head.clone());
                if let Some(graphable) = handle.as_graphable() {
                    reachable.extend(graphable.ancestors(&head)?);
                }
            }
        }
        // Held refs pin their backend's current state even when no branch
        // or root reports it anymore.
        let held: Vec<_> = self.refs.read().values().cloned().collect();
        for backend in held {
            if let Some(snapshotable) = backend.as_snapshotable() {
                if let Some(id) = snapshotable.snapshot_id()? {
                    reachable.insert(id);
                }
            }
        }
        Ok(reachable)
    }

    fn gc_mark_and_retain(
        &self,
        grace_period_ms: u64,
        now: u64,
    ) -> Result<(BTreeSet<SnapshotId>, Vec<RegistryEntry>)> {
        let mut reachable = self.gc_reachable()?;
        // A held entry contributes its snapshot as a root only while its ref
        // is still live; after release_ref the metadata is provenance, not a
        // pin, and eligibility resumes past the grace period.
        let live_refs: std::collections::HashSet<String> =
            self.refs.read().keys().cloned().collect();
        let is_pinned = |entry: &RegistryEntry| {
            entry.is_held()
                && entry
                    .metadata
                    .get(crate::model::META_REF_KEY)
                    .is_some_and(|key| live_refs.contains(key))
        };
        let entries = self.registry.all_entries()?;
        for entry in &entries {
            if is_pinned(entry) {
                reachable.insert(entry.snapshot_id.clone());
            }
        }
        let cutoff = Hlc::new(now.saturating_sub(grace_period_ms), 0);
        let candidates = entries
            .into_iter()
            .filter(|entry| !reachable.contains(&entry.snapshot_id) && entry.hlc < cutoff)
            .collect();
        Ok((reachable, candidates))
    }

    /// Mark and retain without any deletion.
    pub fn gc_report(&self, options: &GcOptions) -> Result<GcReport> {
        let now = wall_clock_ms();
        let (reachable, candidates) = self.gc_mark_and_retain(options.grace_period_ms, now)?;
        let mut by_system: BTreeMap<SystemId, usize> = BTreeMap::new();
        for candidate in &candidates {
            *by_system.entry(candidate.system_id.clone()).or_default() += 1;
        }
        Ok(GcReport {
            total_entries: self.registry.entry_count()?,
            gc_eligible: candidates.len(),
            reachable,
            candidates,
            by_system,
        })
    }

    /// Full mark-retain-sweep run.
    ///
    /// Candidates are grouped per system and handed to that backend's
    /// `gc_sweep`; only after the backend returns are the group's entries
    /// deregistered. A backend that fails keeps its entries registered and
    /// is reported in `errors`. The registry is flushed before the freed
    /// index nodes older than `freed_grace_period_ms` are reclaimed.
    pub fn gc_sweep(&self, options: &GcOptions) -> Result<GcSweepOutcome> {
        let now = wall_clock_ms();
        let (reachable, candidates) = self.gc_mark_and_retain(options.grace_period_ms, now)?;
        if options.dry_run {
            debug!(candidates = candidates.len(), "gc.dry_run");
            return Ok(GcSweepOutcome {
                swept: Vec::new(),
                candidates,
                reachable,
                errors: BTreeMap::new(),
                freed_nodes_swept: 0,
            });
        }

        let mut by_system: BTreeMap<SystemId, Vec<RegistryEntry>> = BTreeMap::new();
        for candidate in candidates.iter().cloned() {
            by_system
                .entry(candidate.system_id.clone())
                .or_default()
                .push(candidate);
        }

        let mut swept = Vec::new();
        let mut errors = BTreeMap::new();
        for (system_id, group) in by_system {
            let Some(backend) = self.system(&system_id) else {
                debug!(system = %system_id, "gc.system_gone");
                continue;
            };
            let Some(collectable) = backend.as_garbage_collectable() else {
                debug!(system = %system_id, "gc.not_collectable");
                continue;
            };
            let ids: BTreeSet<SnapshotId> =
                group.iter().map(|entry| entry.snapshot_id.clone()).collect();
            match collectable.gc_sweep(&ids) {
                Ok(next_handle) => {
                    self.systems.write().insert(system_id.clone(), next_handle);
                    for entry in group {
                        self.registry.deregister(&entry)?;
                        swept.push(entry);
                    }
                }
                Err(err) => {
                    warn!(system = %system_id, %err, "gc.sweep_failed");
                    errors.insert(system_id, err.to_string());
                }
            }
        }

        self.registry.flush()?;
        let freed_cutoff = now.saturating_sub(options.freed_grace_period_ms);
        let freed_nodes_swept = self.registry.sweep_freed(freed_cutoff)?;
        info!(
            swept = swept.len(),
            failed_systems = errors.len(),
            freed_nodes_swept,
            "gc.sweep"
        );
        Ok(GcSweepOutcome {
            swept,
            candidates,
            reachable,
            errors,
            freed_nodes_swept,
        })
    }
}
