//! Composition helpers for multi-system overlay sessions.
//!
//! Stateless conveniences over [`Overlayable`] backends: fork an overlay on
//! each system, merge them down in caller-chosen order with
//! discard-on-failure, and capture a cross-system checkpoint of current
//! snapshot ids. Nothing here is persisted; the workspace and registry are
//! not involved.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::capability::{BackendHandle, OverlayHandle, OverlayOptions, Overlayable};
use crate::error::Result;
use crate::model::{SnapshotId, SystemId, SystemType};

/// One backend's coordinates in a cross-system checkpoint.
#[derive(Clone, Debug)]
pub struct CheckpointRef {
    /// System the snapshot belongs to.
    pub system_id: SystemId,
    /// Current snapshot, or `None` before the first commit.
    pub snapshot_id: Option<SnapshotId>,
    /// Kind of the system.
    pub system_type: SystemType,
}

/// Result of [`commit_seq`].
#[derive(Debug, Default)]
pub struct SequencedCommit {
    /// Systems merged down, in order, with the parent snapshot each produced.
    pub committed: Vec<(SystemId, Option<SnapshotId>)>,
    /// System whose merge failed, if any.
    pub failed: Option<SystemId>,
    /// Systems whose overlays were discarded after the failure.
    pub discarded: Vec<SystemId>,
    /// The failure, rendered.
    pub error: Option<String>,
}

/// Forks an overlay on every backend.
///
/// If any fork fails, overlays created so far are discarded best-effort and
/// the error is returned.
pub fn prepare_all(
    backends: &[BackendHandle],
    opts: &OverlayOptions,
) -> Result<BTreeMap<SystemId, OverlayHandle>> {
    let mut overlays = BTreeMap::new();
    for backend in backends {
        let overlayable: &dyn Overlayable =
            crate::capability::require_overlayable(backend.as_ref())?;
        match overlayable.overlay(opts) {
            Ok(overlay) => {
                overlays.insert(backend.system_id(), overlay);
            }
            Err(err) => {
                warn!(system = %backend.system_id(), %err, "compose.prepare_failed");
                discard_all(overlays.values().cloned().collect::<Vec<_>>().as_slice());
                return Err(err);
            }
        }
    }
    Ok(overlays)
}

/// Merges overlays down in the given order; dependency ordering is the
/// caller's responsibility.
///
/// On the first failure every overlay not yet committed, the failing one
/// included, is discarded and the accumulated outcome is returned.
pub fn commit_seq(overlays: &[OverlayHandle]) -> SequencedCommit {
    let mut outcome = SequencedCommit::default();
    for (position, overlay) in overlays.iter().enumerate() {
        match overlay.merge_down() {
            Ok(parent_snapshot) => {
                debug!(system = %overlay.system_id(), "compose.merged_down");
                outcome
                    .committed
                    .push((overlay.system_id(), parent_snapshot));
            }
            Err(err) => {
                warn!(system = %overlay.system_id(), %err, "compose.commit_seq_failed");
                outcome.failed = Some(overlay.system_id());
                outcome.error = Some(err.to_string());
                let remaining = &overlays[position..];
                discard_all(remaining);
                outcome.discarded = remaining
                    .iter()
                    .map(|overlay| overlay.system_id())
                    .collect();
                break;
            }
        }
    }
    outcome
}

/// Discards every overlay, best effort.
pub fn discard_all(overlays: &[OverlayHandle]) {
    for overlay in overlays {
        if let Err(err) = overlay.discard() {
            warn!(system = %overlay.system_id(), %err, "compose.discard_failed");
        }
    }
}

/// Captures each backend's current snapshot coordinates.
pub fn snapshot_refs(backends: &[BackendHandle]) -> Result<Vec<CheckpointRef>> {
    let mut refs = Vec::with_capacity(backends.len());
    for backend in backends {
        let snapshot_id = match backend.as_snapshotable() {
            Some(snapshotable) => snapshotable.snapshot_id()?,
            None => None,
        };
        refs.push(CheckpointRef {
            system_id: backend.system_id(),
            snapshot_id,
            system_type: backend.system_type(),
        });
    }
    Ok(refs)
}
