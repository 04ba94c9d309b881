//! Capability contracts backends are projected onto.
//!
//! Every capability is optional and advertised through
//! [`Backend::capabilities`]; a consumer asks for the matching view with the
//! `as_*` accessors and treats `None` as [`CapabilityMissing`]. Mutating
//! operations follow value semantics: they return a fresh handle and leave
//! the previous one valid for reads of the pre-change state, to the extent
//! the backend itself supports it.
//!
//! [`CapabilityMissing`]: crate::YggdrasilError::CapabilityMissing

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{
    BranchName, Capabilities, SnapshotId, SnapshotInfo, SystemId, SystemType, WatchEvent,
};

/// Shared, thread-safe handle to a backend.
pub type BackendHandle = Arc<dyn Backend>;

/// Opaque read view over a historical snapshot; the core never inspects it.
pub type ReadView = Box<dyn Any + Send>;

/// Callback invoked with every event a watch observes.
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Identifier of one active watch on a backend.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct WatchId(pub u64);

/// Options for [`Watchable::watch`].
#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    /// Poll interval for backends without native notification.
    pub poll_interval_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

/// Required identity contract; every backend implements it.
///
/// The `as_*` accessors are the runtime capability query: the default
/// implementations answer `None`, and a backend overrides exactly those
/// matching the flags it advertises.
pub trait Backend: Send + Sync {
    /// Identifier of this backend instance.
    fn system_id(&self) -> SystemId;

    /// Kind tag used for hook dispatch.
    fn system_type(&self) -> SystemType;

    /// Capability flags this backend honors.
    fn capabilities(&self) -> Capabilities;

    /// Snapshot view, when advertised.
    fn as_snapshotable(&self) -> Option<&dyn Snapshotable> {
        None
    }

    /// Branch view, when advertised.
    fn as_branchable(&self) -> Option<&dyn Branchable> {
        None
    }

    /// Ancestry view, when advertised.
    fn as_graphable(&self) -> Option<&dyn Graphable> {
        None
    }

    /// Merge view, when advertised.
    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        None
    }

    /// Overlay view, when advertised.
    fn as_overlayable(&self) -> Option<&dyn Overlayable> {
        None
    }

    /// Watch view, when advertised.
    fn as_watchable(&self) -> Option<&dyn Watchable> {
        None
    }

    /// GC view, when advertised.
    fn as_garbage_collectable(&self) -> Option<&dyn GarbageCollectable> {
        None
    }
}

/// Point-in-time snapshot identity and historical reads.
pub trait Snapshotable: Send + Sync {
    /// Id of the current state, or `None` before the first commit.
    fn snapshot_id(&self) -> Result<Option<SnapshotId>>;

    /// Parents of the current state.
    fn parent_ids(&self) -> Result<BTreeSet<SnapshotId>>;

    /// Opaque read view bound to a historical snapshot.
    fn as_of(&self, snapshot: &SnapshotId) -> Result<Option<ReadView>>;

    /// Metadata for one snapshot, or `None` when unknown.
    fn snapshot_meta(&self, snapshot: &SnapshotId) -> Result<Option<SnapshotInfo>>;
}

/// Named mutable pointers.
///
/// `checkout` does not mutate backend state beyond what the backend itself
/// requires; it returns a handle whose subsequent reads and writes bind to
/// the named branch. Writes to the same `(system, branch)` are serialized by
/// a per-branch lock owned by the backend.
pub trait Branchable: Send + Sync {
    /// All branch names.
    fn branches(&self) -> Result<BTreeSet<BranchName>>;

    /// Branch this handle is bound to.
    fn current_branch(&self) -> Result<BranchName>;

    /// Forks a branch; without `from`, forks the current head.
    fn branch(&self, name: &BranchName, from: Option<&SnapshotId>) -> Result<BackendHandle>;

    /// Deletes a branch.
    fn delete_branch(&self, name: &BranchName) -> Result<BackendHandle>;

    /// Returns a handle bound to the named branch.
    fn checkout(&self, name: &BranchName) -> Result<BackendHandle>;
}

/// Options for [`Graphable::history`].
#[derive(Clone, Debug, Default)]
pub struct HistoryOptions {
    /// Maximum number of ids to return.
    pub limit: Option<usize>,
    /// Walk only commits after this id.
    pub since: Option<SnapshotId>,
}

/// Full commit graph as reported by a backend.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    /// Every node with its parents and metadata.
    pub nodes: BTreeMap<SnapshotId, CommitGraphNode>,
    /// Branch heads.
    pub branches: BTreeMap<BranchName, SnapshotId>,
    /// Nodes without parents.
    pub roots: BTreeSet<SnapshotId>,
}

/// One node of a [`CommitGraph`].
#[derive(Clone, Debug, Default)]
pub struct CommitGraphNode {
    /// Parents of the node.
    pub parent_ids: BTreeSet<SnapshotId>,
    /// Opaque per-commit metadata.
    pub meta: BTreeMap<String, String>,
}

/// Commit ancestry walks.
pub trait Graphable: Send + Sync {
    /// Snapshot ids newest first.
    fn history(&self, opts: &HistoryOptions) -> Result<Vec<SnapshotId>>;

    /// All ancestors of a snapshot, nearest first.
    fn ancestors(&self, snapshot: &SnapshotId) -> Result<Vec<SnapshotId>>;

    /// True when `a` is an ancestor of `b`; false when either id is unknown.
    fn is_ancestor(&self, a: &SnapshotId, b: &SnapshotId) -> Result<bool>;

    /// Merge base of two snapshots; `None` when unrelated.
    fn common_ancestor(&self, a: &SnapshotId, b: &SnapshotId) -> Result<Option<SnapshotId>>;

    /// The full graph.
    fn commit_graph(&self) -> Result<CommitGraph>;

    /// Metadata for one commit.
    fn commit_info(&self, snapshot: &SnapshotId) -> Result<Option<SnapshotInfo>>;
}

/// Options threaded through to a backend-native merge.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Backend-specific strategy name.
    pub strategy: Option<String>,
    /// Opaque extra options.
    pub metadata: BTreeMap<String, String>,
}

/// One conflict a backend reports between two snapshots.
///
/// The core only requires this to be produceable; its meaning is defined by
/// the backend's own documentation.
#[derive(Clone, Debug, Default)]
pub struct ConflictDescriptor {
    /// Path or key the conflict is anchored to, when the backend has one.
    pub path: Option<String>,
    /// Backend-specific detail.
    pub detail: BTreeMap<String, String>,
}

/// Opaque description of the difference between two snapshots.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    /// Backend-specific detail.
    pub detail: BTreeMap<String, String>,
}

/// Backend-delegated merging. The core records the produced snapshot id and
/// parents but neither inspects nor validates the merge result.
pub trait Mergeable: Send + Sync {
    /// Merges `source` into the current state.
    fn merge(&self, source: &SnapshotId, opts: &MergeOptions) -> Result<BackendHandle>;

    /// Conflicts between two snapshots.
    fn conflicts(&self, a: &SnapshotId, b: &SnapshotId) -> Result<Vec<ConflictDescriptor>>;

    /// Difference between two snapshots.
    fn diff(&self, a: &SnapshotId, b: &SnapshotId) -> Result<Delta>;
}

/// Visibility mode of a live fork.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OverlayMode {
    /// Base fixed at creation; parent updates invisible.
    Frozen,
    /// Reads always see the parent's latest state; local writes shadow.
    Following,
    /// Base updated only at [`OverlaySession::advance`].
    Gated,
}

/// Options for [`Overlayable::overlay`].
#[derive(Clone, Debug)]
pub struct OverlayOptions {
    /// Requested visibility mode.
    pub mode: OverlayMode,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            mode: OverlayMode::Frozen,
        }
    }
}

/// Shared handle to a live overlay session.
pub type OverlayHandle = Arc<dyn OverlaySession>;

/// Live fork produced by [`Overlayable::overlay`].
pub trait OverlaySession: Send + Sync {
    /// System the overlay forked from.
    fn system_id(&self) -> SystemId;

    /// Visibility mode the overlay was created with.
    fn mode(&self) -> OverlayMode;

    /// Snapshot the overlay currently reads through.
    fn base_ref(&self) -> Result<Option<SnapshotId>>;

    /// Parent's latest snapshot without changing the base.
    fn peek_parent(&self) -> Result<Option<SnapshotId>>;

    /// Gated refresh: moves the base to the parent's latest snapshot.
    ///
    /// Implementations must observe the parent atomically, e.g. with a
    /// sequence lock (read version, read state, validate version). Returns
    /// the new base.
    fn advance(&self) -> Result<Option<SnapshotId>>;

    /// Opaque descriptors of the writes shadowed by this overlay.
    fn overlay_writes(&self) -> Result<Vec<String>>;

    /// Commits the overlay's writes into the parent; returns the parent's
    /// new snapshot.
    fn merge_down(&self) -> Result<Option<SnapshotId>>;

    /// Abandons the overlay and its writes.
    fn discard(&self) -> Result<()>;
}

/// Live forks with visibility modes.
pub trait Overlayable: Send + Sync {
    /// Creates a live fork of the current state.
    fn overlay(&self, opts: &OverlayOptions) -> Result<OverlayHandle>;
}

/// Change notification.
pub trait Watchable: Send + Sync {
    /// Registers a callback for every observed event.
    fn watch(&self, callback: WatchCallback, opts: &WatchOptions) -> Result<WatchId>;

    /// Removes a previously registered watch.
    fn unwatch(&self, id: WatchId) -> Result<()>;
}

/// Negotiated deletion of unreachable snapshots.
pub trait GarbageCollectable: Send + Sync {
    /// Branch heads and anything else the backend considers live.
    fn gc_roots(&self) -> Result<BTreeSet<SnapshotId>>;

    /// Deletes the candidate ids the backend considers safe per its own
    /// policy; unsafe ids are silently retained.
    fn gc_sweep(&self, candidates: &BTreeSet<SnapshotId>) -> Result<BackendHandle>;
}

/// Looks up a capability view or fails with the typed error.
macro_rules! require_capability {
    ($backend:expr, $accessor:ident, $name:literal) => {
        match $backend.$accessor() {
            Some(view) => Ok(view),
            None => Err($crate::YggdrasilError::capability(
                $backend.system_id().as_str(),
                $name,
            )),
        }
    };
}

/// Snapshot view or `CapabilityMissing`.
pub fn require_snapshotable(backend: &dyn Backend) -> Result<&dyn Snapshotable> {
    require_capability!(backend, as_snapshotable, "snapshotable")
}

/// Branch view or `CapabilityMissing`.
pub fn require_branchable(backend: &dyn Backend) -> Result<&dyn Branchable> {
    require_capability!(backend, as_branchable, "branchable")
}

/// Ancestry view or `CapabilityMissing`.
pub fn require_graphable(backend: &dyn Backend) -> Result<&dyn Graphable> {
    require_capability!(backend, as_graphable, "graphable")
}

/// Overlay view or `CapabilityMissing`.
pub fn require_overlayable(backend: &dyn Backend) -> Result<&dyn Overlayable> {
    require_capability!(backend, as_overlayable, "overlayable")
}

/// Watch view or `CapabilityMissing`.
pub fn require_watchable(backend: &dyn Backend) -> Result<&dyn Watchable> {
    require_capability!(backend, as_watchable, "watchable")
}
