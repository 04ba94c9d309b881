//! Managed workspace over heterogeneous backends.
//!
//! The workspace owns the managed backends, the shared hybrid logical clock,
//! the snapshot registry, held refs that pin snapshots against GC, and a
//! connection cache of checked-out branch handles. It drives coordinated
//! multi-system commits and temporal `as-of-world` queries; the GC
//! coordinator in [`crate::gc`] operates on the same state.

mod hooks;

pub use hooks::{CommitHooks, HookId, HookInstaller, HookRemover, OnCommit};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::capability::{
    require_branchable, require_graphable, require_snapshotable, Backend, BackendHandle,
    HistoryOptions,
};
use crate::config::WorkspaceOptions;
use crate::error::{Result, YggdrasilError};
use crate::hlc::{Hlc, SharedHlc};
use crate::model::{
    BranchName, RegistryEntry, SnapshotId, SystemId, META_HELD, META_REF_KEY, META_SOURCE,
    SOURCE_COMMIT, SOURCE_HOOK, SOURCE_MANAGE, SOURCE_SYNC,
};
use crate::registry::SnapshotRegistry;

/// Backend-native commit action run by [`Workspace::coordinated_commit`].
pub type CommitFn = Box<dyn FnOnce(&dyn Backend) -> Result<SnapshotId> + Send>;

/// Outcome of a coordinated multi-system commit.
///
/// Never a hard failure: successes and failures are partitioned per system
/// and the caller decides whether to reconcile or abandon. Every successful
/// sub-commit carries the same pinned [`Hlc`].
#[derive(Debug)]
pub struct CoordinatedCommit {
    /// Registered entry per successfully committed system.
    pub results: BTreeMap<SystemId, RegistryEntry>,
    /// Failure per system whose commit function failed.
    pub errors: BTreeMap<SystemId, YggdrasilError>,
    /// The stamp shared by all successful sub-commits.
    pub hlc: Hlc,
}

/// Single-owner coordination point over N managed backends.
pub struct Workspace {
    pub(crate) hlc: Arc<SharedHlc>,
    pub(crate) registry: Arc<SnapshotRegistry>,
    pub(crate) systems: RwLock<FxHashMap<SystemId, BackendHandle>>,
    pub(crate) refs: RwLock<FxHashMap<String, BackendHandle>>,
    pub(crate) conn_cache: RwLock<FxHashMap<(SystemId, BranchName), BackendHandle>>,
    installed: RwLock<FxHashMap<SystemId, HookId>>,
    hooks: CommitHooks,
}

impl Workspace {
    /// Opens a workspace per the given options.
    pub fn open(options: WorkspaceOptions) -> Result<Self> {
        let registry = match &options.store_path {
            Some(path) => SnapshotRegistry::open_with_cache(path, options.node_cache_capacity)?,
            None => SnapshotRegistry::in_memory()?,
        };
        info!(
            persistent = options.store_path.is_some(),
            "workspace.open"
        );
        Ok(Self {
            hlc: Arc::new(SharedHlc::new()),
            registry: Arc::new(registry),
            systems: RwLock::new(FxHashMap::default()),
            refs: RwLock::new(FxHashMap::default()),
            conn_cache: RwLock::new(FxHashMap::default()),
            installed: RwLock::new(FxHashMap::default()),
            hooks: CommitHooks::new(options.hook_poll_interval_ms),
        })
    }

    /// Opens an ephemeral workspace.
    pub fn in_memory() -> Result<Self> {
        Self::open(WorkspaceOptions::default())
    }

    /// The workspace's registry.
    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    /// The hook dispatcher, for registering native installers.
    pub fn hooks(&self) -> &CommitHooks {
        &self.hooks
    }

    /// Ids of all managed systems.
    pub fn system_ids(&self) -> Vec<SystemId> {
        self.systems.read().keys().cloned().collect()
    }

    /// Latest handle for one managed system.
    pub fn system(&self, system_id: &SystemId) -> Option<BackendHandle> {
        self.systems.read().get(system_id).cloned()
    }

    /// Keys of all held refs.
    pub fn held_refs(&self) -> Vec<String> {
        self.refs.read().keys().cloned().collect()
    }

    /// Handle bound to `(system, branch)`, reusing a cached checkout.
    fn checkout_cached(
        &self,
        backend: &BackendHandle,
        branch: &BranchName,
    ) -> Result<BackendHandle> {
        let key = (backend.system_id(), branch.clone());
        if let Some(handle) = self.conn_cache.read().get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = require_branchable(backend.as_ref())?.checkout(branch)?;
        self.conn_cache
            .write()
            .insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    // --- shared clock -------------------------------------------------------

    /// Advances the shared clock.
    pub fn tick(&self) -> Hlc {
        self.hlc.tick()
    }

    /// Current stamp without advancing.
    pub fn current_hlc(&self) -> Hlc {
        self.hlc.current()
    }

    /// Merges a remote stamp into the shared clock.
    pub fn receive_hlc(&self, remote: Hlc) -> Hlc {
        self.hlc.receive(remote)
    }

    /// Pins the stamp for a coordinated transaction.
    pub fn begin_transaction(&self) -> Hlc {
        self.tick()
    }

    // --- system lifecycle ---------------------------------------------------

    /// Inserts a backend and registers its current state, when observable.
    pub fn add_system(&self, backend: BackendHandle) -> Result<()> {
        let system_id = backend.system_id();
        if let Some(snapshotable) = backend.as_snapshotable() {
            if let Some(snapshot_id) = snapshotable.snapshot_id()? {
                let branch = current_branch_or_default(backend.as_ref())?;
                let mut entry =
                    RegistryEntry::new(snapshot_id, system_id.clone(), branch, self.hlc.tick());
                entry.parent_ids = snapshotable.parent_ids()?;
                entry
                    .metadata
                    .insert(META_SOURCE.to_string(), SOURCE_MANAGE.to_string());
                self.registry.register(entry)?;
            }
        }
        debug!(system = %system_id, "workspace.add_system");
        self.systems.write().insert(system_id, backend);
        Ok(())
    }

    /// Adds a backend and installs a commit hook that auto-registers every
    /// observed commit under a fresh workspace stamp.
    ///
    /// Hook installation failures are soft: the system stays managed, only
    /// auto-registration is inactive.
    pub fn manage(&self, backend: BackendHandle) -> Result<()> {
        self.add_system(Arc::clone(&backend))?;
        let system_id = backend.system_id();
        let on_commit = self.hook_callback(system_id.clone());
        match self.hooks.install(backend.as_ref(), on_commit) {
            Ok(Some(hook_id)) => {
                self.installed.write().insert(system_id, hook_id);
            }
            Ok(None) => {
                debug!(system = %system_id, "workspace.manage.no_hook");
            }
            Err(err) => {
                warn!(system = %system_id, %err, "workspace.manage.hook_failed");
            }
        }
        Ok(())
    }

    fn hook_callback(&self, system_id: SystemId) -> OnCommit {
        let hlc = Arc::clone(&self.hlc);
        let registry = Arc::clone(&self.registry);
        Arc::new(move |event| {
            let Some(snapshot_id) = event.snapshot_id() else {
                debug!(system = %system_id, "workspace.hook.event_without_snapshot");
                return;
            };
            let branch = event.branch().cloned().unwrap_or_default();
            let mut entry = RegistryEntry::new(
                snapshot_id.clone(),
                system_id.clone(),
                branch,
                hlc.tick(),
            );
            entry
                .metadata
                .insert(META_SOURCE.to_string(), SOURCE_HOOK.to_string());
            if let Err(err) = registry.register(entry) {
                warn!(system = %system_id, %err, "workspace.hook.register_failed");
            }
        })
    }

    /// Removes a system: hook removal is best effort, then the handle and
    /// its cached branch connections are dropped.
    pub fn unmanage(&self, system_id: &SystemId) -> Result<()> {
        let backend = self
            .systems
            .write()
            .remove(system_id)
            .ok_or_else(|| YggdrasilError::NotFound(format!("system {system_id}")))?;
        if let Some(hook_id) = self.installed.write().remove(system_id) {
            if let Err(err) = self.hooks.remove(backend.as_ref(), hook_id) {
                warn!(system = %system_id, %err, "workspace.unmanage.hook_removal_failed");
            }
        }
        self.conn_cache
            .write()
            .retain(|(cached_system, _), _| cached_system != system_id);
        debug!(system = %system_id, "workspace.unmanage");
        Ok(())
    }

    // --- commits ------------------------------------------------------------

    /// Runs one backend-native commit under a pinned stamp and registers the
    /// produced snapshot.
    ///
    /// The entry's parents are the backend's pre-commit head, so the
    /// registered lineage reflects what the commit superseded.
    pub fn commit_with_hlc<F>(
        &self,
        system_id: &SystemId,
        hlc: Hlc,
        commit_fn: F,
    ) -> Result<RegistryEntry>
    where
        F: FnOnce(&dyn Backend) -> Result<SnapshotId>,
    {
        let backend = self
            .system(system_id)
            .ok_or_else(|| YggdrasilError::NotFound(format!("system {system_id}")))?;
        let parents = match backend.as_snapshotable() {
            Some(snapshotable) => snapshotable.snapshot_id()?.into_iter().collect(),
            None => Default::default(),
        };
        let branch = current_branch_or_default(backend.as_ref())?;
        let snapshot_id = commit_fn(backend.as_ref())?;
        let mut entry = RegistryEntry::new(snapshot_id, system_id.clone(), branch, hlc);
        entry.parent_ids = parents;
        entry
            .metadata
            .insert(META_SOURCE.to_string(), SOURCE_COMMIT.to_string());
        self.registry.register(entry.clone())?;
        Ok(entry)
    }

    /// Commits across several systems under one pinned stamp.
    ///
    /// Partial-failure semantics: each failure is captured per system,
    /// successes stay registered, and nothing is rolled back. The identical
    /// stamp across all successes is the cross-system transaction marker.
    pub fn coordinated_commit(
        &self,
        commit_fns: BTreeMap<SystemId, CommitFn>,
    ) -> CoordinatedCommit {
        let hlc = self.begin_transaction();
        let mut results = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (system_id, commit_fn) in commit_fns {
            match self.commit_with_hlc(&system_id, hlc, commit_fn) {
                Ok(entry) => {
                    results.insert(system_id, entry);
                }
                Err(err) => {
                    warn!(system = %system_id, %err, "workspace.coordinated_commit.sub_failed");
                    errors.insert(system_id, err);
                }
            }
        }
        info!(
            ok = results.len(),
            failed = errors.len(),
            hlc = %hlc,
            "workspace.coordinated_commit"
        );
        CoordinatedCommit {
            results,
            errors,
            hlc,
        }
    }

    // --- held refs ----------------------------------------------------------

    /// Pins the backend's current snapshot under `ref_key`.
    ///
    /// The registered entry carries `held=true` and is treated as a GC root
    /// until [`Workspace::release_ref`].
    pub fn hold_ref(&self, ref_key: &str, backend: BackendHandle) -> Result<RegistryEntry> {
        let snapshotable = require_snapshotable(backend.as_ref())?;
        let snapshot_id = snapshotable.snapshot_id()?.ok_or_else(|| {
            YggdrasilError::NotFound(format!("snapshot to hold on {}", backend.system_id()))
        })?;
        let system_id = backend.system_id();
        let branch = current_branch_or_default(backend.as_ref())?;
        let mut entry = RegistryEntry::new(
            snapshot_id,
            system_id.clone(),
            branch.clone(),
            self.hlc.tick(),
        );
        entry
            .metadata
            .insert(META_HELD.to_string(), "true".to_string());
        entry
            .metadata
            .insert(META_REF_KEY.to_string(), ref_key.to_string());
        self.registry.register(entry.clone())?;
        self.refs
            .write()
            .insert(ref_key.to_string(), Arc::clone(&backend));
        self.conn_cache.write().insert((system_id, branch), backend);
        debug!(ref_key, "workspace.hold_ref");
        Ok(entry)
    }

    /// Releases a held ref; GC eligibility resumes after the grace period.
    pub fn release_ref(&self, ref_key: &str) -> Result<()> {
        let backend = self
            .refs
            .write()
            .remove(ref_key)
            .ok_or_else(|| YggdrasilError::NotFound(format!("ref {ref_key}")))?;
        let system_id = backend.system_id();
        self.conn_cache
            .write()
            .retain(|(cached_system, _), _| *cached_system != system_id);
        debug!(ref_key, "workspace.release_ref");
        Ok(())
    }

    // --- temporal queries ---------------------------------------------------

    /// World state at `hlc`: the latest entry per `(system, branch)` not
    /// newer than the stamp.
    pub fn as_of_world(
        &self,
        hlc: Hlc,
    ) -> Result<BTreeMap<(SystemId, BranchName), RegistryEntry>> {
        self.registry.as_of(hlc)
    }

    /// World state at a wall-clock millisecond, using the HLC ceiling of
    /// that instant.
    pub fn as_of_time(&self, ms: u64) -> Result<BTreeMap<(SystemId, BranchName), RegistryEntry>> {
        self.as_of_world(Hlc::ceiling(ms))
    }

    // --- registry resync ----------------------------------------------------

    /// Walks every branch of a branchable+graphable backend and registers
    /// commits the registry has not seen; returns how many were added.
    ///
    /// Stamps favor archaeology over linearity: a backend-reported commit
    /// timestamp becomes `(timestamp_ms, 0)` so resynced history sorts where
    /// it happened, even before existing workspace stamps. Commits without a
    /// timestamp get a fresh tick.
    pub fn sync_registry(&self, system_id: &SystemId) -> Result<usize> {
        let backend = self
            .system(system_id)
            .ok_or_else(|| YggdrasilError::NotFound(format!("system {system_id}")))?;
        let branchable = require_branchable(backend.as_ref())?;
        require_graphable(backend.as_ref())?;
        let mut discovered = Vec::new();
        for branch in branchable.branches()? {
            let handle = self.checkout_cached(&backend, &branch)?;
            let graph = require_graphable(handle.as_ref())?;
            let known: HashSet<SnapshotId> = self
                .registry
                .system_history(system_id, &branch, None, None)?
                .into_iter()
                .map(|entry| entry.snapshot_id)
                .collect();
            for snapshot_id in graph.history(&HistoryOptions::default())? {
                if known.contains(&snapshot_id) {
                    continue;
                }
                let info = graph.commit_info(&snapshot_id)?;
                let hlc = match info.as_ref().and_then(|i| i.timestamp_ms) {
                    Some(timestamp_ms) => Hlc::new(timestamp_ms, 0),
                    None => self.hlc.tick(),
                };
                let mut entry =
                    RegistryEntry::new(snapshot_id, system_id.clone(), branch.clone(), hlc);
                if let Some(info) = info {
                    entry.parent_ids = info.parent_ids;
                    if let Some(message) = info.message {
                        entry.metadata.insert("message".to_string(), message);
                    }
                    if let Some(author) = info.author {
                        entry.metadata.insert("author".to_string(), author);
                    }
                }
                entry
                    .metadata
                    .insert(META_SOURCE.to_string(), SOURCE_SYNC.to_string());
                discovered.push(entry);
            }
        }
        let count = discovered.len();
        self.registry.register_batch(discovered)?;
        info!(system = %system_id, count, "workspace.sync_registry");
        Ok(count)
    }

    // --- lifecycle ----------------------------------------------------------

    /// Removes all hooks, then flushes and closes the registry.
    pub fn close(&self) -> Result<()> {
        let installed: Vec<(SystemId, HookId)> = self.installed.write().drain().collect();
        for (system_id, hook_id) in installed {
            if let Some(backend) = self.system(&system_id) {
                if let Err(err) = self.hooks.remove(backend.as_ref(), hook_id) {
                    warn!(system = %system_id, %err, "workspace.close.hook_removal_failed");
                }
            }
        }
        self.registry.close()?;
        info!("workspace.close");
        Ok(())
    }
}

/// Branch a registration binds to: the backend's current branch when it is
/// branchable, the default otherwise.
fn current_branch_or_default(backend: &dyn Backend) -> Result<BranchName> {
    match backend.as_branchable() {
        Some(branchable) => branchable.current_branch(),
        None => Ok(BranchName::default()),
    }
}
