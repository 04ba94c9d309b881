//! Core records shared across the coordination layer.
//!
//! Identifiers are opaque strings minted by backends; the core compares them
//! by equality and never parses them. [`RegistryEntry`] is the single element
//! type of the durable index and records one observation of a backend state
//! at a hybrid-logical-clock stamp.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hlc::Hlc;

/// Native snapshot identifier as reported by a backend (hash, UUID, numeric).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

/// Identifier of one managed backend instance.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(pub String);

/// Name of a mutable pointer inside a backend.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }
    };
}

string_id!(SnapshotId);
string_id!(SystemId);
string_id!(BranchName);

impl Default for BranchName {
    fn default() -> Self {
        BranchName("main".to_string())
    }
}

/// Metadata key marking an entry registered for a held ref.
pub const META_HELD: &str = "held";
/// Metadata key recording the ref key an entry was held under.
pub const META_REF_KEY: &str = "ref-key";
/// Metadata key recording which path produced an entry.
pub const META_SOURCE: &str = "source";
/// `source` value for hook-driven registration.
pub const SOURCE_HOOK: &str = "hook";
/// `source` value for registration at manage time.
pub const SOURCE_MANAGE: &str = "manage";
/// `source` value for explicit coordinated commits.
pub const SOURCE_COMMIT: &str = "commit";
/// `source` value for entries discovered by a registry resync.
pub const SOURCE_SYNC: &str = "sync";

/// One observation of a backend state, stamped with the workspace clock.
///
/// Entries are ordered by [`EntryKey`]; `content_hash`, `parent_ids`, and
/// `metadata` carry no identity. `parent_ids` is informational only: GC
/// reachability walks backend ancestry, never this field.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RegistryEntry {
    /// Native id as observed.
    pub snapshot_id: SnapshotId,
    /// Originating backend instance.
    pub system_id: SystemId,
    /// Branch at the time of observation.
    pub branch_name: BranchName,
    /// Stamp assigned at registration (not the backend's wall clock).
    pub hlc: Hlc,
    /// Optional dedup hint, opaque to the core.
    pub content_hash: Option<String>,
    /// Parents as reported by the backend at observation time; may be empty.
    pub parent_ids: BTreeSet<SnapshotId>,
    /// Opaque annotations (message, author, source tag, ...).
    pub metadata: BTreeMap<String, String>,
}

impl RegistryEntry {
    /// Creates an entry with no content hash, parents, or metadata.
    pub fn new(
        snapshot_id: impl Into<SnapshotId>,
        system_id: impl Into<SystemId>,
        branch_name: impl Into<BranchName>,
        hlc: Hlc,
    ) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            system_id: system_id.into(),
            branch_name: branch_name.into(),
            hlc,
            content_hash: None,
            parent_ids: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Composite ordering key: `(hlc, system_id, branch_name, snapshot_id)`.
    pub fn key(&self) -> EntryKey {
        EntryKey {
            hlc: self.hlc,
            system_id: self.system_id.clone(),
            branch_name: self.branch_name.clone(),
            snapshot_id: self.snapshot_id.clone(),
        }
    }

    /// True when the entry was registered on behalf of a held ref.
    pub fn is_held(&self) -> bool {
        self.metadata.get(META_HELD).map(String::as_str) == Some("true")
    }

    /// Projects the entry onto the cross-language [`SnapshotRef`] wire shape.
    pub fn to_snapshot_ref(&self) -> SnapshotRef {
        SnapshotRef {
            system_id: self.system_id.clone(),
            snapshot_id: self.snapshot_id.clone(),
            parent_ids: self.parent_ids.iter().cloned().collect(),
            hlc: self.hlc,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Total order over registry entries.
///
/// The leading HLC component makes temporal slices a prefix of the index.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EntryKey {
    /// Registration stamp, the leading component.
    pub hlc: Hlc,
    /// Originating system.
    pub system_id: SystemId,
    /// Branch at observation time.
    pub branch_name: BranchName,
    /// Observed snapshot id.
    pub snapshot_id: SnapshotId,
}

/// Capability flags advertised by a backend.
///
/// Consumers must treat an absent capability as an error and never synthesize
/// the behavior themselves.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Capabilities {
    /// Exposes point-in-time snapshot identity and read views.
    pub snapshotable: bool,
    /// Exposes named mutable branch pointers.
    pub branchable: bool,
    /// Exposes commit ancestry walks.
    pub graphable: bool,
    /// Can merge one snapshot into another.
    pub mergeable: bool,
    /// Supports live forks with visibility modes.
    pub overlayable: bool,
    /// Emits change notifications.
    pub watchable: bool,
    /// Negotiates deletion of unreachable snapshots.
    pub garbage_collectable: bool,
    /// States are content-addressed.
    pub addressable: bool,
    /// Accepts caller-driven commits.
    pub committable: bool,
}

impl Capabilities {
    /// Flags for a backend that only identifies itself.
    pub fn none() -> Self {
        Self::default()
    }

    /// Marks the backend snapshotable.
    pub fn snapshotable(mut self) -> Self {
        self.snapshotable = true;
        self
    }

    /// Marks the backend branchable.
    pub fn branchable(mut self) -> Self {
        self.branchable = true;
        self
    }

    /// Marks the backend graphable.
    pub fn graphable(mut self) -> Self {
        self.graphable = true;
        self
    }

    /// Marks the backend mergeable.
    pub fn mergeable(mut self) -> Self {
        self.mergeable = true;
        self
    }

    /// Marks the backend overlayable.
    pub fn overlayable(mut self) -> Self {
        self.overlayable = true;
        self
    }

    /// Marks the backend watchable.
    pub fn watchable(mut self) -> Self {
        self.watchable = true;
        self
    }

    /// Marks the backend garbage-collectable.
    pub fn garbage_collectable(mut self) -> Self {
        self.garbage_collectable = true;
        self
    }

    /// Marks the backend content-addressed.
    pub fn addressable(mut self) -> Self {
        self.addressable = true;
        self
    }

    /// Marks the backend committable.
    pub fn committable(mut self) -> Self {
        self.committable = true;
        self
    }
}

/// Closed set of backend kinds, used for commit-hook dispatch.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum SystemType {
    /// Git working copy or bare repository.
    Git,
    /// ZFS dataset.
    Zfs,
    /// Btrfs subvolume.
    Btrfs,
    /// OverlayFS mount stack.
    OverlayFs,
    /// Podman container image layers.
    Podman,
    /// IPFS content-addressed store.
    Ipfs,
    /// Iceberg table.
    Iceberg,
    /// lakeFS repository.
    LakeFs,
    /// Dolt database.
    Dolt,
    /// Datahike database.
    Datahike,
    /// Aggregate over several managed systems.
    Composite,
    /// In-process store used by tests and examples.
    Memory,
    /// Adapter-defined kind outside the closed set.
    Other(String),
}

impl SystemType {
    /// Stable lowercase tag for the kind.
    pub fn as_str(&self) -> &str {
        match self {
            SystemType::Git => "git",
            SystemType::Zfs => "zfs",
            SystemType::Btrfs => "btrfs",
            SystemType::OverlayFs => "overlayfs",
            SystemType::Podman => "podman",
            SystemType::Ipfs => "ipfs",
            SystemType::Iceberg => "iceberg",
            SystemType::LakeFs => "lakefs",
            SystemType::Dolt => "dolt",
            SystemType::Datahike => "datahike",
            SystemType::Composite => "composite",
            SystemType::Memory => "memory",
            SystemType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a backend reports for a single snapshot.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SnapshotInfo {
    /// Snapshot the record describes.
    pub snapshot_id: SnapshotId,
    /// Parents of the snapshot.
    pub parent_ids: BTreeSet<SnapshotId>,
    /// Backend-reported wall-clock time in milliseconds, when known.
    pub timestamp_ms: Option<u64>,
    /// Commit message, when the backend has one.
    pub message: Option<String>,
    /// Author, when the backend has one.
    pub author: Option<String>,
}

impl SnapshotInfo {
    /// Creates a record with only the snapshot id populated.
    pub fn new(snapshot_id: impl Into<SnapshotId>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            ..Self::default()
        }
    }
}

/// Cross-language wire shape for one registered snapshot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Originating system.
    #[serde(rename = "system-id")]
    pub system_id: SystemId,
    /// Observed snapshot id.
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: SnapshotId,
    /// Parents as recorded at observation time.
    #[serde(rename = "parent-ids")]
    pub parent_ids: Vec<SnapshotId>,
    /// Registration stamp.
    pub hlc: Hlc,
    /// Optional dedup hint.
    #[serde(rename = "content-hash")]
    pub content_hash: Option<String>,
}

impl SnapshotRef {
    /// Serializes to the JSON wire format.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the JSON wire format.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Change notification produced by watchable backends.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WatchEvent {
    /// A new commit appeared on a branch.
    Commit {
        /// Id of the new commit, when the backend reports one.
        snapshot_id: Option<SnapshotId>,
        /// Branch the commit landed on, when known.
        branch: Option<BranchName>,
        /// Event wall-clock time in milliseconds.
        timestamp_ms: u64,
    },
    /// A branch was created.
    BranchCreated {
        /// The new branch.
        branch: BranchName,
        /// Event wall-clock time in milliseconds.
        timestamp_ms: u64,
    },
    /// A branch was deleted.
    BranchDeleted {
        /// The removed branch.
        branch: BranchName,
        /// Event wall-clock time in milliseconds.
        timestamp_ms: u64,
    },
    /// The checked-out branch changed.
    Checkout {
        /// The branch now checked out.
        branch: BranchName,
        /// Event wall-clock time in milliseconds.
        timestamp_ms: u64,
    },
}

impl WatchEvent {
    /// True for commit events.
    pub fn is_commit(&self) -> bool {
        matches!(self, WatchEvent::Commit { .. })
    }

    /// Snapshot id carried by the event, if any.
    pub fn snapshot_id(&self) -> Option<&SnapshotId> {
        match self {
            WatchEvent::Commit { snapshot_id, .. } => snapshot_id.as_ref(),
            _ => None,
        }
    }

    /// Branch carried by the event, if any.
    pub fn branch(&self) -> Option<&BranchName> {
        match self {
            WatchEvent::Commit { branch, .. } => branch.as_ref(),
            WatchEvent::BranchCreated { branch, .. }
            | WatchEvent::BranchDeleted { branch, .. }
            | WatchEvent::Checkout { branch, .. } => Some(branch),
        }
    }

    /// Wall-clock time of the event in milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            WatchEvent::Commit { timestamp_ms, .. }
            | WatchEvent::BranchCreated { timestamp_ms, .. }
            | WatchEvent::BranchDeleted { timestamp_ms, .. }
            | WatchEvent::Checkout { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}
