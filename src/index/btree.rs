//! Content-addressed B-tree set over registry entries.
//!
//! Mutations copy the path from root to leaf; untouched subtrees stay behind
//! their persisted addresses and are materialized lazily through the
//! [`NodeStore`]. Superseded addresses accumulate until [`EntryTree::flush`]
//! hands them to the freed map for the deferred sweep.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::index::{Address, Link, NodeStore, TreeNode, BRANCHING_FACTOR};
use crate::model::{EntryKey, RegistryEntry};

const ORDER: usize = BRANCHING_FACTOR;
const MIN_FANOUT: usize = ORDER / 2;

/// Compares an entry against a composite key without allocating.
pub(crate) fn cmp_entry_key(entry: &RegistryEntry, key: &EntryKey) -> Ordering {
    entry
        .hlc
        .cmp(&key.hlc)
        .then_with(|| entry.system_id.cmp(&key.system_id))
        .then_with(|| entry.branch_name.cmp(&key.branch_name))
        .then_with(|| entry.snapshot_id.cmp(&key.snapshot_id))
}

fn cmp_entries(a: &RegistryEntry, b: &RegistryEntry) -> Ordering {
    a.hlc
        .cmp(&b.hlc)
        .then_with(|| a.system_id.cmp(&b.system_id))
        .then_with(|| a.branch_name.cmp(&b.branch_name))
        .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
}

fn load(store: &NodeStore, link: &Link) -> Result<Arc<TreeNode>> {
    match link {
        Link::Mem(node) => Ok(Arc::clone(node)),
        Link::Disk(address) => store.restore(address),
    }
}

/// Records a replaced on-disk node for the freed map.
fn supersede(link: &Link, pending: &mut Vec<Address>) {
    if let Link::Disk(address) = link {
        pending.push(address.clone());
    }
}

enum Inserted {
    One(Arc<TreeNode>),
    Split(Arc<TreeNode>, Arc<TreeNode>),
}

enum Removed {
    NotFound,
    Node(Arc<TreeNode>),
}

/// Ordered set of registry entries with lazily loaded persistent nodes.
pub(crate) struct EntryTree {
    root: Option<Link>,
    len: Option<usize>,
    pending_free: Vec<Address>,
}

impl EntryTree {
    /// Empty tree.
    pub fn empty() -> Self {
        Self {
            root: None,
            len: Some(0),
            pending_free: Vec::new(),
        }
    }

    /// Tree rooted at a persisted address; the size is unknown until counted.
    pub fn from_root(address: Address) -> Self {
        Self {
            root: Some(Link::Disk(address)),
            len: None,
            pending_free: Vec::new(),
        }
    }

    /// Cached size, when known.
    pub fn cached_len(&self) -> Option<usize> {
        self.len
    }

    /// Counts entries with a full scan and caches the result.
    pub fn count(&mut self, store: &NodeStore) -> Result<usize> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let mut n = 0;
        self.for_each_while(store, None, |_| {
            n += 1;
            true
        })?;
        self.len = Some(n);
        Ok(n)
    }

    /// True when the tree has mutations the store has not seen.
    pub fn has_unflushed(&self) -> bool {
        matches!(self.root, Some(Link::Mem(_))) || !self.pending_free.is_empty()
    }

    /// Inserts an entry; returns `true` when it was not already present.
    ///
    /// An entry equal under the composite key replaces the stored one, so
    /// re-registration can refresh metadata without growing the set.
    pub fn insert(&mut self, store: &NodeStore, entry: RegistryEntry) -> Result<bool> {
        let root = match &self.root {
            None => {
                self.root = Some(Link::Mem(Arc::new(TreeNode::Leaf(vec![entry]))));
                if let Some(len) = self.len.as_mut() {
                    *len += 1;
                }
                return Ok(true);
            }
            Some(link) => link.clone(),
        };
        let (result, added) = self.insert_rec(store, &root, entry)?;
        supersede(&root, &mut self.pending_free);
        self.root = Some(match result {
            Inserted::One(node) => Link::Mem(node),
            Inserted::Split(left, right) => {
                let level = left.level() + 1;
                let seps = vec![
                    left.max_entry().expect("split half is non-empty").clone(),
                    right.max_entry().expect("split half is non-empty").clone(),
                ];
                Link::Mem(Arc::new(TreeNode::Branch {
                    level,
                    seps,
                    children: vec![Link::Mem(left), Link::Mem(right)],
                }))
            }
        });
        if added {
            if let Some(len) = self.len.as_mut() {
                *len += 1;
            }
        }
        Ok(added)
    }

    fn insert_rec(
        &mut self,
        store: &NodeStore,
        link: &Link,
        entry: RegistryEntry,
    ) -> Result<(Inserted, bool)> {
        let node = load(store, link)?;
        match &*node {
            TreeNode::Leaf(entries) => {
                let mut entries = entries.clone();
                let added = match entries.binary_search_by(|e| cmp_entries(e, &entry)) {
                    Ok(i) => {
                        entries[i] = entry;
                        false
                    }
                    Err(i) => {
                        entries.insert(i, entry);
                        true
                    }
                };
                Ok((split_leaf(entries), added))
            }
            TreeNode::Branch {
                level,
                seps,
                children,
            } => {
                let idx = seps
                    .partition_point(|sep| cmp_entries(sep, &entry) == Ordering::Less)
                    .min(children.len() - 1);
                let (child_result, added) = self.insert_rec(store, &children[idx], entry)?;
                supersede(&children[idx], &mut self.pending_free);
                let mut seps = seps.clone();
                let mut children = children.clone();
                match child_result {
                    Inserted::One(child) => {
                        seps[idx] = child.max_entry().expect("child is non-empty").clone();
                        children[idx] = Link::Mem(child);
                    }
                    Inserted::Split(left, right) => {
                        seps[idx] = left.max_entry().expect("split half is non-empty").clone();
                        seps.insert(
                            idx + 1,
                            right.max_entry().expect("split half is non-empty").clone(),
                        );
                        children[idx] = Link::Mem(left);
                        children.insert(idx + 1, Link::Mem(right));
                    }
                }
                Ok((split_branch(*level, seps, children), added))
            }
        }
    }

    /// Removes the entry with the given key; returns `true` when found.
    pub fn remove(&mut self, store: &NodeStore, key: &EntryKey) -> Result<bool> {
        let root = match &self.root {
            None => return Ok(false),
            Some(link) => link.clone(),
        };
        let removed = self.remove_rec(store, &root, key)?;
        let node = match removed {
            Removed::NotFound => return Ok(false),
            Removed::Node(node) => node,
        };
        supersede(&root, &mut self.pending_free);
        if node.fanout() == 0 {
            self.root = None;
        } else {
            // Collapse single-child roots left behind by merges.
            let mut current = node;
            let link = loop {
                match &*current {
                    TreeNode::Branch { children, .. } if children.len() == 1 => {
                        match &children[0] {
                            Link::Mem(child) => current = Arc::clone(child),
                            Link::Disk(address) => break Link::Disk(address.clone()),
                        }
                    }
                    _ => break Link::Mem(current),
                }
            };
            self.root = Some(link);
        }
        if let Some(len) = self.len.as_mut() {
            *len -= 1;
        }
        Ok(true)
    }

    fn remove_rec(&mut self, store: &NodeStore, link: &Link, key: &EntryKey) -> Result<Removed> {
        let node = load(store, link)?;
        match &*node {
            TreeNode::Leaf(entries) => match entries.binary_search_by(|e| cmp_entry_key(e, key)) {
                Err(_) => Ok(Removed::NotFound),
                Ok(i) => {
                    let mut entries = entries.clone();
                    entries.remove(i);
                    Ok(Removed::Node(Arc::new(TreeNode::Leaf(entries))))
                }
            },
            TreeNode::Branch {
                level,
                seps,
                children,
            } => {
                let idx = seps.partition_point(|sep| cmp_entry_key(sep, key) == Ordering::Less);
                if idx == children.len() {
                    return Ok(Removed::NotFound);
                }
                let child = match self.remove_rec(store, &children[idx], key)? {
                    Removed::NotFound => return Ok(Removed::NotFound),
                    Removed::Node(child) => child,
                };
                supersede(&children[idx], &mut self.pending_free);
                let mut seps = seps.clone();
                let mut children = children.clone();
                if child.fanout() == 0 {
                    seps.remove(idx);
                    children.remove(idx);
                } else {
                    seps[idx] = child.max_entry().expect("child is non-empty").clone();
                    children[idx] = Link::Mem(Arc::clone(&child));
                    if child.fanout() < MIN_FANOUT && children.len() > 1 {
                        self.merge_with_sibling(store, &mut seps, &mut children, idx)?;
                    }
                }
                if children.is_empty() {
                    return Ok(Removed::Node(Arc::new(TreeNode::Leaf(Vec::new()))));
                }
                Ok(Removed::Node(Arc::new(TreeNode::Branch {
                    level: *level,
                    seps,
                    children,
                })))
            }
        }
    }

    /// Merges the underfull child at `idx` with an adjacent sibling,
    /// re-splitting when the combined node would overflow.
    fn merge_with_sibling(
        &mut self,
        store: &NodeStore,
        seps: &mut Vec<RegistryEntry>,
        children: &mut Vec<Link>,
        idx: usize,
    ) -> Result<()> {
        let (left_idx, right_idx) = if idx + 1 < children.len() {
            (idx, idx + 1)
        } else {
            (idx - 1, idx)
        };
        let left = load(store, &children[left_idx])?;
        let right = load(store, &children[right_idx])?;
        supersede(&children[left_idx], &mut self.pending_free);
        supersede(&children[right_idx], &mut self.pending_free);
        let replacement = match merge_nodes(&left, &right) {
            Inserted::One(node) => {
                let sep = node.max_entry().expect("merged node is non-empty").clone();
                seps.splice(left_idx..=right_idx, [sep]);
                vec![Link::Mem(node)]
            }
            Inserted::Split(l, r) => {
                let sl = l.max_entry().expect("split half is non-empty").clone();
                let sr = r.max_entry().expect("split half is non-empty").clone();
                seps.splice(left_idx..=right_idx, [sl, sr]);
                vec![Link::Mem(l), Link::Mem(r)]
            }
        };
        children.splice(left_idx..=right_idx, replacement);
        Ok(())
    }

    /// Looks up the entry with the given key.
    pub fn get(&self, store: &NodeStore, key: &EntryKey) -> Result<Option<RegistryEntry>> {
        let mut link = match &self.root {
            None => return Ok(None),
            Some(link) => link.clone(),
        };
        loop {
            let node = load(store, &link)?;
            match &*node {
                TreeNode::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|e| cmp_entry_key(e, key))
                        .ok()
                        .map(|i| entries[i].clone()));
                }
                TreeNode::Branch { seps, children, .. } => {
                    let idx = seps.partition_point(|sep| cmp_entry_key(sep, key) == Ordering::Less);
                    if idx == children.len() {
                        return Ok(None);
                    }
                    link = children[idx].clone();
                }
            }
        }
    }

    /// In-order walk, skipping subtrees entirely below `lo` and stopping when
    /// `visit` returns `false`.
    pub fn for_each_while<F>(
        &self,
        store: &NodeStore,
        lo: Option<&EntryKey>,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&RegistryEntry) -> bool,
    {
        if let Some(root) = &self.root {
            walk(store, root, lo, &mut visit)?;
        }
        Ok(())
    }

    /// Writes every transient node, records superseded addresses as freed,
    /// and returns the new root address.
    pub fn flush(&mut self, store: &NodeStore) -> Result<Option<Address>> {
        let root_address = match self.root.take() {
            None => None,
            Some(link) => {
                let flushed = flush_link(store, link)?;
                let address = match &flushed {
                    Link::Disk(address) => address.clone(),
                    Link::Mem(_) => unreachable!("flush_link always returns a disk link"),
                };
                self.root = Some(flushed);
                Some(address)
            }
        };
        for address in self.pending_free.drain(..) {
            store.mark_freed(&address);
        }
        Ok(root_address)
    }
}

fn walk<F>(store: &NodeStore, link: &Link, lo: Option<&EntryKey>, visit: &mut F) -> Result<bool>
where
    F: FnMut(&RegistryEntry) -> bool,
{
    let node = load(store, link)?;
    match &*node {
        TreeNode::Leaf(entries) => {
            for entry in entries {
                if let Some(lo) = lo {
                    if cmp_entry_key(entry, lo) == Ordering::Less {
                        continue;
                    }
                }
                if !visit(entry) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        TreeNode::Branch { seps, children, .. } => {
            for (sep, child) in seps.iter().zip(children) {
                if let Some(lo) = lo {
                    if cmp_entry_key(sep, lo) == Ordering::Less {
                        continue;
                    }
                }
                if !walk(store, child, lo, visit)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

fn split_leaf(entries: Vec<RegistryEntry>) -> Inserted {
    if entries.len() <= ORDER {
        return Inserted::One(Arc::new(TreeNode::Leaf(entries)));
    }
    let mut left = entries;
    let right = left.split_off(left.len() / 2);
    Inserted::Split(
        Arc::new(TreeNode::Leaf(left)),
        Arc::new(TreeNode::Leaf(right)),
    )
}

fn split_branch(level: u32, seps: Vec<RegistryEntry>, children: Vec<Link>) -> Inserted {
    if children.len() <= ORDER {
        return Inserted::One(Arc::new(TreeNode::Branch {
            level,
            seps,
            children,
        }));
    }
    let mid = children.len() / 2;
    let mut left_seps = seps;
    let right_seps = left_seps.split_off(mid);
    let mut left_children = children;
    let right_children = left_children.split_off(mid);
    Inserted::Split(
        Arc::new(TreeNode::Branch {
            level,
            seps: left_seps,
            children: left_children,
        }),
        Arc::new(TreeNode::Branch {
            level,
            seps: right_seps,
            children: right_children,
        }),
    )
}

fn merge_nodes(left: &TreeNode, right: &TreeNode) -> Inserted {
    match (left, right) {
        (TreeNode::Leaf(a), TreeNode::Leaf(b)) => {
            let mut entries = a.clone();
            entries.extend(b.iter().cloned());
            split_leaf(entries)
        }
        (
            TreeNode::Branch {
                level,
                seps: sa,
                children: ca,
            },
            TreeNode::Branch {
                seps: sb,
                children: cb,
                ..
            },
        ) => {
            let mut seps = sa.clone();
            seps.extend(sb.iter().cloned());
            let mut children = ca.clone();
            children.extend(cb.iter().cloned());
            split_branch(*level, seps, children)
        }
        _ => unreachable!("siblings always share a level"),
    }
}

fn flush_link(store: &NodeStore, link: Link) -> Result<Link> {
    match link {
        Link::Disk(address) => Ok(Link::Disk(address)),
        Link::Mem(node) => {
            let storable = match &*node {
                TreeNode::Leaf(_) => node,
                TreeNode::Branch {
                    level,
                    seps,
                    children,
                } => {
                    let mut flushed = Vec::with_capacity(children.len());
                    for child in children {
                        flushed.push(flush_link(store, child.clone())?);
                    }
                    Arc::new(TreeNode::Branch {
                        level: *level,
                        seps: seps.clone(),
                        children: flushed,
                    })
                }
            };
            let address = store.store(storable)?;
            Ok(Link::Disk(address))
        }
    }
}
