//! # Yggdrasil - Cross-System Snapshot Coordination
//!
//! Yggdrasil unifies heterogeneous copy-on-write storage backends (version
//! control, object stores, databases, container layers) under one layered
//! capability protocol. A workspace treats N independent backends as a
//! single logical branched history: a shared hybrid logical clock orders
//! observations across systems, a durable sorted registry answers temporal
//! as-of queries, and a conservative coordinator drives multi-system
//! commits and cross-backend garbage collection.
//!
//! ## Quick Start
//!
//! ```rust
//! use yggdrasil::{RegistryEntry, Workspace};
//!
//! // Open an ephemeral workspace (pass WorkspaceOptions::persistent for disk).
//! let workspace = Workspace::in_memory()?;
//!
//! // Observations are stamped with the shared hybrid logical clock.
//! let hlc = workspace.tick();
//! workspace
//!     .registry()
//!     .register(RegistryEntry::new("snap-1", "git-main", "main", hlc))?;
//!
//! // Temporal query: the state of every (system, branch) at a stamp.
//! let world = workspace.as_of_world(workspace.current_hlc())?;
//! assert_eq!(world.len(), 1);
//! # Ok::<(), yggdrasil::YggdrasilError>(())
//! ```
//!
//! ## Architecture
//!
//! Layered, leaves first:
//! - **Capability traits** ([`capability`]): the optional contracts any
//!   backend may implement, behind value-semantics handles.
//! - **Durable index** ([`index`] over [`store`]): a content-addressed
//!   B-tree of registry entries with lazy node loading and deferred
//!   reclamation of superseded nodes.
//! - **Registry** ([`registry`]): append/remove plus `as-of`, range, and
//!   history queries over the index.
//! - **Workspace** ([`workspace`]): owns backends, the shared clock
//!   ([`hlc`]), held refs, and commit hooks; [`gc`] and [`compose`] operate
//!   on top.
//! - **Watch runtime** ([`watch`]): a shared daemon pool polling backends
//!   that lack native change notification.

pub mod capability;
pub mod compose;
pub mod config;
pub mod error;
pub mod gc;
pub mod hlc;
pub mod index;
pub mod logging;
pub mod model;
pub mod registry;
pub mod store;
pub mod watch;
pub mod workspace;

// Re-export the main public API.
pub use crate::capability::{
    Backend, BackendHandle, Branchable, CommitGraph, GarbageCollectable, Graphable,
    HistoryOptions, Mergeable, OverlayHandle, OverlayMode, OverlayOptions, OverlaySession,
    Overlayable, Snapshotable, WatchCallback, WatchId, WatchOptions, Watchable,
};
pub use crate::config::WorkspaceOptions;
pub use crate::error::{Result, YggdrasilError};
pub use crate::gc::{GcOptions, GcReport, GcSweepOutcome};
pub use crate::hlc::{Hlc, SharedHlc};
pub use crate::model::{
    BranchName, Capabilities, RegistryEntry, SnapshotId, SnapshotInfo, SnapshotRef, SystemId,
    SystemType, WatchEvent,
};
pub use crate::registry::SnapshotRegistry;
pub use crate::workspace::{CommitFn, CommitHooks, CoordinatedCommit, HookId, Workspace};
