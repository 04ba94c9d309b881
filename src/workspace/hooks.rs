//! Commit-hook installation.
//!
//! Hooks are dispatched on [`SystemType`]: an adapter may register a native
//! installer for its kind (inotify, trigger tables, ...), and everything
//! else falls back to filtering the backend's own `watch` stream down to
//! commit events. Installation failures are soft at the workspace level.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::capability::{Backend, WatchId, WatchOptions};
use crate::error::Result;
use crate::model::{SystemType, WatchEvent};

/// Identifier of one installed commit hook.
///
/// For the watch fallback this wraps the backend's watch id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HookId(pub u64);

/// Callback invoked for every observed commit.
pub type OnCommit = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Native hook installer registered for one backend kind.
pub type HookInstaller = Box<dyn Fn(&dyn Backend, OnCommit) -> Result<Option<HookId>> + Send + Sync>;

/// Native hook remover registered for one backend kind.
pub type HookRemover = Box<dyn Fn(&dyn Backend, HookId) -> Result<()> + Send + Sync>;

struct HookKind {
    install: HookInstaller,
    remove: HookRemover,
}

/// Type-dispatched commit-hook installer with a polling fallback.
pub struct CommitHooks {
    kinds: RwLock<HashMap<SystemType, HookKind>>,
    poll_interval_ms: u64,
}

impl CommitHooks {
    /// Creates a dispatcher whose watch fallback polls at `poll_interval_ms`.
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            poll_interval_ms,
        }
    }

    /// Registers a native installer/remover pair for one backend kind,
    /// replacing any previous registration.
    pub fn register_kind(
        &self,
        system_type: SystemType,
        install: HookInstaller,
        remove: HookRemover,
    ) {
        self.kinds
            .write()
            .insert(system_type, HookKind { install, remove });
    }

    /// Installs a commit hook on `backend`.
    ///
    /// Returns `None` when no native installer matches and the backend is
    /// not watchable; auto-registration is simply inactive then.
    pub fn install(&self, backend: &dyn Backend, on_commit: OnCommit) -> Result<Option<HookId>> {
        if let Some(kind) = self.kinds.read().get(&backend.system_type()) {
            return (kind.install)(backend, on_commit);
        }
        let Some(watchable) = backend.as_watchable() else {
            debug!(
                system = %backend.system_id(),
                kind = %backend.system_type(),
                "hooks.no_notification_path"
            );
            return Ok(None);
        };
        let filtered: OnCommit = Arc::new(move |event: &WatchEvent| {
            if event.is_commit() {
                on_commit(event);
            }
        });
        let opts = WatchOptions {
            poll_interval_ms: self.poll_interval_ms,
        };
        let watch_id = watchable.watch(filtered, &opts)?;
        debug!(
            system = %backend.system_id(),
            watch = watch_id.0,
            "hooks.watch_fallback_installed"
        );
        Ok(Some(HookId(watch_id.0)))
    }

    /// Removes a previously installed hook.
    pub fn remove(&self, backend: &dyn Backend, hook: HookId) -> Result<()> {
        if let Some(kind) = self.kinds.read().get(&backend.system_type()) {
            return (kind.remove)(backend, hook);
        }
        match backend.as_watchable() {
            Some(watchable) => watchable.unwatch(WatchId(hook.0)),
            None => Ok(()),
        }
    }
}
