//! Durable sorted-set index.
//!
//! The registry's entries live in a content-addressed B-tree ([`btree`])
//! whose nodes are serialized one-per-key into a [`BlobStore`]. This module
//! owns the node model, the serialization boundary (entries become plain
//! JSON maps, checksummed with crc32), and the [`NodeStore`] that caches
//! materialized nodes and tracks freed addresses for the deferred sweep.

pub mod btree;

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{Result, YggdrasilError};
use crate::hlc::Hlc;
use crate::model::{BranchName, RegistryEntry, SnapshotId, SystemId};
use crate::store::BlobStore;

/// Well-known key holding the address of the current tree root.
pub const INDEX_ROOT_KEY: &str = "index-root";
/// Well-known key holding the freed-address map.
pub const FREED_KEY: &str = "freed";

/// Branching factor of the index tree, fixed at build time.
pub const BRANCHING_FACTOR: usize = 64;

/// Opaque address of one persisted node.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Address(pub String);

impl Address {
    /// Mints a fresh address.
    pub fn fresh() -> Self {
        Address(Uuid::new_v4().to_string())
    }

    /// The address as a store key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link from a branch node to one child: either materialized in memory
/// (not yet flushed) or an address into the store.
#[derive(Clone, Debug)]
pub(crate) enum Link {
    /// Transient node produced by a mutation since the last flush.
    Mem(Arc<TreeNode>),
    /// Persisted node, materialized on demand.
    Disk(Address),
}

/// One node of the index tree.
#[derive(Clone, Debug)]
pub(crate) enum TreeNode {
    /// Sorted run of entries.
    Leaf(Vec<RegistryEntry>),
    /// Interior node; `seps[i]` is the maximum entry of subtree `i`.
    Branch {
        level: u32,
        seps: Vec<RegistryEntry>,
        children: Vec<Link>,
    },
}

impl TreeNode {
    /// Maximum entry in the subtree rooted here.
    pub(crate) fn max_entry(&self) -> Option<&RegistryEntry> {
        match self {
            TreeNode::Leaf(entries) => entries.last(),
            TreeNode::Branch { seps, .. } => seps.last(),
        }
    }

    pub(crate) fn level(&self) -> u32 {
        match self {
            TreeNode::Leaf(_) => 0,
            TreeNode::Branch { level, .. } => *level,
        }
    }

    pub(crate) fn fanout(&self) -> usize {
        match self {
            TreeNode::Leaf(entries) => entries.len(),
            TreeNode::Branch { children, .. } => children.len(),
        }
    }
}

// --- serialization boundary -------------------------------------------------
//
// Entries cross into the store as plain maps so the serializer never learns
// about the record types. Node payloads are prefixed with a crc32 of the JSON
// body, mirrored from the page checksum discipline of the pager.

pub(crate) fn entry_to_value(entry: &RegistryEntry) -> Value {
    json!({
        "snapshot_id": entry.snapshot_id.as_str(),
        "system_id": entry.system_id.as_str(),
        "branch_name": entry.branch_name.as_str(),
        "hlc": { "physical": entry.hlc.physical, "logical": entry.hlc.logical },
        "content_hash": entry.content_hash.as_deref(),
        "parent_ids": entry.parent_ids.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        "metadata": &entry.metadata,
    })
}

fn require_str(map: &Map<String, Value>, field: &str) -> Result<String> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| YggdrasilError::InvariantViolation(format!("entry field {field} malformed")))
}

fn require_u64(map: &Map<String, Value>, field: &str) -> Result<u64> {
    map.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| YggdrasilError::InvariantViolation(format!("entry field {field} malformed")))
}

pub(crate) fn entry_from_value(value: &Value) -> Result<RegistryEntry> {
    let map = value
        .as_object()
        .ok_or_else(|| YggdrasilError::InvariantViolation("entry is not a map".into()))?;
    let hlc_map = map
        .get("hlc")
        .and_then(Value::as_object)
        .ok_or_else(|| YggdrasilError::InvariantViolation("entry hlc malformed".into()))?;
    let hlc = Hlc::new(
        require_u64(hlc_map, "physical")?,
        require_u64(hlc_map, "logical")? as u32,
    );
    let content_hash = match map.get("content_hash") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(YggdrasilError::InvariantViolation(
                "entry content_hash malformed".into(),
            ))
        }
    };
    let parent_ids: BTreeSet<SnapshotId> = map
        .get("parent_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(SnapshotId::from)
                .collect()
        })
        .unwrap_or_default();
    let metadata: BTreeMap<String, String> = map
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(RegistryEntry {
        snapshot_id: SnapshotId(require_str(map, "snapshot_id")?),
        system_id: SystemId(require_str(map, "system_id")?),
        branch_name: BranchName(require_str(map, "branch_name")?),
        hlc,
        content_hash,
        parent_ids,
        metadata,
    })
}

fn node_to_value(node: &TreeNode) -> Result<Value> {
    match node {
        TreeNode::Leaf(entries) => Ok(json!({
            "level": 0,
            "keys": entries.iter().map(entry_to_value).collect::<Vec<_>>(),
        })),
        TreeNode::Branch {
            level,
            seps,
            children,
        } => {
            let mut addresses = Vec::with_capacity(children.len());
            for child in children {
                match child {
                    Link::Disk(addr) => addresses.push(Value::String(addr.0.clone())),
                    Link::Mem(_) => {
                        return Err(YggdrasilError::InvariantViolation(
                            "unflushed child reached the serialization boundary".into(),
                        ))
                    }
                }
            }
            Ok(json!({
                "level": level,
                "keys": seps.iter().map(entry_to_value).collect::<Vec<_>>(),
                "addresses": addresses,
            }))
        }
    }
}

fn node_from_value(value: &Value) -> Result<TreeNode> {
    let map = value
        .as_object()
        .ok_or_else(|| YggdrasilError::InvariantViolation("node is not a map".into()))?;
    let level = require_u64(map, "level")? as u32;
    let keys = map
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| YggdrasilError::InvariantViolation("node keys malformed".into()))?
        .iter()
        .map(entry_from_value)
        .collect::<Result<Vec<_>>>()?;
    if level == 0 {
        return Ok(TreeNode::Leaf(keys));
    }
    let children = map
        .get("addresses")
        .and_then(Value::as_array)
        .ok_or_else(|| YggdrasilError::InvariantViolation("branch addresses malformed".into()))?
        .iter()
        .map(|a| {
            a.as_str().map(|s| Link::Disk(Address(s.to_string()))).ok_or_else(|| {
                YggdrasilError::InvariantViolation("branch address malformed".into())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if children.len() != keys.len() {
        return Err(YggdrasilError::InvariantViolation(
            "branch separator/address arity mismatch".into(),
        ));
    }
    Ok(TreeNode::Branch {
        level,
        seps: keys,
        children,
    })
}

fn node_to_bytes(node: &TreeNode) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&node_to_value(node)?)?;
    let crc = crc32fast::hash(&body);
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn node_from_bytes(bytes: &[u8]) -> Result<TreeNode> {
    if bytes.len() < 4 {
        return Err(YggdrasilError::InvariantViolation(
            "persisted node shorter than its checksum".into(),
        ));
    }
    let (crc_bytes, body) = bytes.split_at(4);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(YggdrasilError::InvariantViolation(format!(
            "node checksum mismatch: stored {expected:#010x}, computed {actual:#010x}"
        )));
    }
    let value: Value = serde_json::from_slice(body)?;
    node_from_value(&value)
}

// --- node store -------------------------------------------------------------

/// Counters for node store traffic.
#[derive(Default)]
pub struct NodeStoreMetrics {
    stores: AtomicU64,
    loads: AtomicU64,
    cache_hits: AtomicU64,
    frees: AtomicU64,
}

/// Snapshot of [`NodeStoreMetrics`] at a point in time.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStoreMetricsSnapshot {
    /// Nodes serialized and persisted.
    pub stores: u64,
    /// Nodes materialized from the blob store.
    pub loads: u64,
    /// Materializations answered from the cache.
    pub cache_hits: u64,
    /// Addresses marked freed.
    pub frees: u64,
}

impl NodeStoreMetrics {
    fn snapshot(&self) -> NodeStoreMetricsSnapshot {
        NodeStoreMetricsSnapshot {
            stores: self.stores.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

/// Storage adapter the tree is written against.
///
/// `store`/`restore` may race benignly: concurrent materialization of the
/// same address yields identical content.
pub struct NodeStore {
    blobs: Arc<dyn BlobStore>,
    cache: Mutex<LruCache<Address, Arc<TreeNode>>>,
    freed: Mutex<FxHashMap<String, u64>>,
    metrics: NodeStoreMetrics,
}

impl NodeStore {
    /// Wraps a blob store, loading any persisted freed map.
    pub fn open(blobs: Arc<dyn BlobStore>, cache_capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("capacity clamped to >= 1");
        let freed = match blobs.get(FREED_KEY)? {
            Some(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)?;
                value
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_u64().map(|ts| (k.clone(), ts)))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None => FxHashMap::default(),
        };
        Ok(Self {
            blobs,
            cache: Mutex::new(LruCache::new(capacity)),
            freed: Mutex::new(freed),
            metrics: NodeStoreMetrics::default(),
        })
    }

    /// Serializes and persists a node under a fresh address.
    pub(crate) fn store(&self, node: Arc<TreeNode>) -> Result<Address> {
        let address = Address::fresh();
        let bytes = node_to_bytes(&node)?;
        self.blobs.assoc(address.as_str(), &bytes)?;
        self.cache.lock().put(address.clone(), node);
        self.metrics.stores.fetch_add(1, Ordering::Relaxed);
        trace!(address = %address, bytes = bytes.len(), "index.node.store");
        Ok(address)
    }

    /// Materializes the node at `address`, preferring the cache.
    pub(crate) fn restore(&self, address: &Address) -> Result<Arc<TreeNode>> {
        if let Some(node) = self.cache.lock().get(address) {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(node));
        }
        let bytes = self.blobs.get(address.as_str())?.ok_or_else(|| {
            YggdrasilError::InvariantViolation(format!("index node {address} missing from store"))
        })?;
        let node = Arc::new(node_from_bytes(&bytes)?);
        self.metrics.loads.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().put(address.clone(), Arc::clone(&node));
        Ok(node)
    }

    /// Records `address` as superseded at the current wall-clock time.
    pub(crate) fn mark_freed(&self, address: &Address) {
        let now = crate::hlc::wall_clock_ms();
        self.freed.lock().insert(address.0.clone(), now);
        self.metrics.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// True when `address` is marked freed.
    pub fn is_freed(&self, address: &Address) -> bool {
        self.freed.lock().contains_key(&address.0)
    }

    /// Free-marking timestamp for `address`, when marked.
    pub fn freed_info(&self, address: &Address) -> Option<u64> {
        self.freed.lock().get(&address.0).copied()
    }

    /// Number of freed addresses awaiting the sweep.
    pub fn freed_count(&self) -> usize {
        self.freed.lock().len()
    }

    /// Writes the freed map under [`FREED_KEY`].
    pub(crate) fn persist_freed(&self) -> Result<()> {
        let freed = self.freed.lock();
        let map: Map<String, Value> = freed
            .iter()
            .map(|(k, ts)| (k.clone(), Value::from(*ts)))
            .collect();
        drop(freed);
        self.blobs.assoc(FREED_KEY, &serde_json::to_vec(&Value::Object(map))?)?;
        Ok(())
    }

    /// Physically deletes freed nodes whose marking time precedes `cutoff_ms`.
    pub(crate) fn sweep_freed(&self, cutoff_ms: u64) -> Result<usize> {
        let due: Vec<String> = {
            let freed = self.freed.lock();
            freed
                .iter()
                .filter(|(_, ts)| **ts < cutoff_ms)
                .map(|(addr, _)| addr.clone())
                .collect()
        };
        let mut swept = 0;
        for addr in due {
            match self.blobs.dissoc(&addr) {
                Ok(()) => {
                    self.freed.lock().remove(&addr);
                    self.cache.lock().pop(&Address(addr));
                    swept += 1;
                }
                Err(err) => {
                    warn!(address = %addr, %err, "index.freed.sweep_failed");
                }
            }
        }
        if swept > 0 {
            self.persist_freed()?;
        }
        Ok(swept)
    }

    /// Records the current root address under [`INDEX_ROOT_KEY`].
    pub(crate) fn write_root(&self, root: Option<&Address>) -> Result<()> {
        match root {
            Some(addr) => self.blobs.assoc(INDEX_ROOT_KEY, addr.as_str().as_bytes()),
            None => self.blobs.dissoc(INDEX_ROOT_KEY),
        }
    }

    /// Loads the persisted root address, if any.
    pub(crate) fn read_root(&self) -> Result<Option<Address>> {
        match self.blobs.get(INDEX_ROOT_KEY)? {
            Some(bytes) => {
                let addr = String::from_utf8(bytes).map_err(|_| {
                    YggdrasilError::InvariantViolation("index root key is not utf-8".into())
                })?;
                Ok(Some(Address(addr)))
            }
            None => Ok(None),
        }
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> NodeStoreMetricsSnapshot {
        self.metrics.snapshot()
    }
}
