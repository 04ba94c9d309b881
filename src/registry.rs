//! Persistent snapshot registry with its temporal index.
//!
//! The registry is the durable record of every observed backend state. It
//! sits on the sorted-set index of [`crate::index`], so temporal queries are
//! bounded scans over the HLC-leading composite key. Mutations run under a
//! single-writer lock; queries share a read lock against a consistent root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::error::{Result, YggdrasilError};
use crate::hlc::Hlc;
use crate::index::btree::EntryTree;
use crate::index::{Address, NodeStore, NodeStoreMetricsSnapshot};
use crate::model::{BranchName, EntryKey, RegistryEntry, SnapshotId, SystemId};
use crate::store::{BlobStore, FileBlobStore, MemoryBlobStore};

/// Default capacity of the materialized-node cache.
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 1024;

struct RegistryInner {
    tree: EntryTree,
    dirty: bool,
}

/// Durable, sorted, temporal index of [`RegistryEntry`] observations.
pub struct SnapshotRegistry {
    store: NodeStore,
    inner: RwLock<RegistryInner>,
    path: Option<PathBuf>,
}

impl SnapshotRegistry {
    /// Opens a persistent registry under `path`, restoring the index root if
    /// one was flushed before.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_cache(path, DEFAULT_NODE_CACHE_CAPACITY)
    }

    /// Opens a persistent registry with an explicit node-cache capacity.
    pub fn open_with_cache(path: impl AsRef<Path>, cache_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&path)?);
        let mut registry = Self::from_blobs(blobs, cache_capacity)?;
        registry.path = Some(path.clone());
        info!(path = %path.display(), "registry.open");
        Ok(registry)
    }

    /// Opens an ephemeral in-memory registry.
    pub fn in_memory() -> Result<Self> {
        Self::from_blobs(Arc::new(MemoryBlobStore::new()), DEFAULT_NODE_CACHE_CAPACITY)
    }

    /// Opens a registry over an arbitrary blob store.
    pub fn from_blobs(blobs: Arc<dyn BlobStore>, cache_capacity: usize) -> Result<Self> {
        let store = NodeStore::open(blobs, cache_capacity)?;
        let tree = match store.read_root()? {
            Some(root) => {
                debug!(root = %root, "registry.restore_root");
                EntryTree::from_root(root)
            }
            None => EntryTree::empty(),
        };
        Ok(Self {
            store,
            inner: RwLock::new(RegistryInner { tree, dirty: false }),
            path: None,
        })
    }

    /// Directory backing this registry, when persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn validate(entry: &RegistryEntry) -> Result<()> {
        if entry.snapshot_id.as_str().is_empty() {
            return Err(YggdrasilError::InvalidArgument(
                "registry entry without snapshot id".into(),
            ));
        }
        if entry.system_id.as_str().is_empty() {
            return Err(YggdrasilError::InvalidArgument(
                "registry entry without system id".into(),
            ));
        }
        Ok(())
    }

    /// Records one observation. Re-registering the same composite key
    /// replaces the stored entry.
    pub fn register(&self, entry: RegistryEntry) -> Result<()> {
        Self::validate(&entry)?;
        let mut inner = self.inner.write();
        trace!(
            system = %entry.system_id,
            branch = %entry.branch_name,
            snapshot = %entry.snapshot_id,
            hlc = %entry.hlc,
            "registry.register"
        );
        inner.tree.insert(&self.store, entry)?;
        inner.dirty = true;
        Ok(())
    }

    /// Records a batch of observations under one writer-lock acquisition.
    pub fn register_batch(&self, entries: Vec<RegistryEntry>) -> Result<()> {
        for entry in &entries {
            Self::validate(entry)?;
        }
        let mut inner = self.inner.write();
        let count = entries.len();
        for entry in entries {
            inner.tree.insert(&self.store, entry)?;
        }
        if count > 0 {
            inner.dirty = true;
        }
        trace!(count, "registry.register_batch");
        Ok(())
    }

    /// Removes one observation; returns `true` when it was present.
    ///
    /// Called by the GC coordinator only after the owning backend confirmed
    /// native deletion.
    pub fn deregister(&self, entry: &RegistryEntry) -> Result<bool> {
        let mut inner = self.inner.write();
        let removed = inner.tree.remove(&self.store, &entry.key())?;
        if removed {
            inner.dirty = true;
        }
        Ok(removed)
    }

    /// Writes the dirty index and freed map to the store in one step.
    /// Idempotent on a clean registry.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.dirty && !inner.tree.has_unflushed() {
            return Ok(());
        }
        let root = inner.tree.flush(&self.store)?;
        self.store.write_root(root.as_ref())?;
        self.store.persist_freed()?;
        inner.dirty = false;
        debug!(root = root.as_ref().map(Address::as_str).unwrap_or("-"), "registry.flush");
        Ok(())
    }

    /// True when mutations have not been flushed yet.
    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// World state at `hlc`: the highest-stamped entry per
    /// `(system, branch)` among entries with `entry.hlc <= hlc`.
    pub fn as_of(&self, hlc: Hlc) -> Result<BTreeMap<(SystemId, BranchName), RegistryEntry>> {
        let inner = self.inner.read();
        let mut world = BTreeMap::new();
        inner.tree.for_each_while(&self.store, None, |entry| {
            if entry.hlc > hlc {
                return false;
            }
            world.insert(
                (entry.system_id.clone(), entry.branch_name.clone()),
                entry.clone(),
            );
            true
        })?;
        Ok(world)
    }

    /// Entries with `lo <= hlc <= hi` in HLC order.
    pub fn entries_in_range(&self, lo: Hlc, hi: Hlc) -> Result<Vec<RegistryEntry>> {
        let inner = self.inner.read();
        let lower = EntryKey {
            hlc: lo,
            system_id: SystemId(String::new()),
            branch_name: BranchName(String::new()),
            snapshot_id: SnapshotId(String::new()),
        };
        let mut out = Vec::new();
        inner.tree.for_each_while(&self.store, Some(&lower), |entry| {
            if entry.hlc > hi {
                return false;
            }
            out.push(entry.clone());
            true
        })?;
        Ok(out)
    }

    /// Observations of one `(system, branch)`, newest first.
    ///
    /// `since` is an exclusive lower bound on the stamp; `limit` caps the
    /// result after ordering.
    pub fn system_history(
        &self,
        system_id: &SystemId,
        branch_name: &BranchName,
        limit: Option<usize>,
        since: Option<Hlc>,
    ) -> Result<Vec<RegistryEntry>> {
        let inner = self.inner.read();
        let mut matches = Vec::new();
        inner.tree.for_each_while(&self.store, None, |entry| {
            if entry.system_id == *system_id
                && entry.branch_name == *branch_name
                && since.map_or(true, |s| entry.hlc > s)
            {
                matches.push(entry.clone());
            }
            true
        })?;
        matches.reverse();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    /// Every registered observation of `snapshot_id`, across all systems.
    pub fn snapshot_refs(&self, snapshot_id: &SnapshotId) -> Result<Vec<RegistryEntry>> {
        let inner = self.inner.read();
        let mut matches = Vec::new();
        inner.tree.for_each_while(&self.store, None, |entry| {
            if entry.snapshot_id == *snapshot_id {
                matches.push(entry.clone());
            }
            true
        })?;
        Ok(matches)
    }

    /// Highest-stamped entry for one `(system, branch)`.
    pub fn latest(
        &self,
        system_id: &SystemId,
        branch_name: &BranchName,
    ) -> Result<Option<RegistryEntry>> {
        let inner = self.inner.read();
        let mut newest = None;
        inner.tree.for_each_while(&self.store, None, |entry| {
            if entry.system_id == *system_id && entry.branch_name == *branch_name {
                newest = Some(entry.clone());
            }
            true
        })?;
        Ok(newest)
    }

    /// Every registered entry in HLC order.
    pub fn all_entries(&self) -> Result<Vec<RegistryEntry>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        inner.tree.for_each_while(&self.store, None, |entry| {
            out.push(entry.clone());
            true
        })?;
        Ok(out)
    }

    /// Number of registered entries.
    pub fn entry_count(&self) -> Result<usize> {
        let mut inner = self.inner.write();
        inner.tree.count(&self.store)
    }

    /// Traffic counters of the underlying node store.
    pub fn index_metrics(&self) -> NodeStoreMetricsSnapshot {
        self.store.metrics()
    }

    /// Physically deletes freed index nodes older than `cutoff_ms`.
    pub(crate) fn sweep_freed(&self, cutoff_ms: u64) -> Result<usize> {
        self.store.sweep_freed(cutoff_ms)
    }

    /// Flushes and releases the registry.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        info!("registry.close");
        Ok(())
    }
}
