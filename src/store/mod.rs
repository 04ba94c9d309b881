//! Durable key-value blob store behind the registry index.
//!
//! The index only needs three operations: [`BlobStore::assoc`],
//! [`BlobStore::get`], and [`BlobStore::dissoc`]. Two implementations ship
//! with the crate: a directory-backed store with atomic writes and a purely
//! in-memory store for ephemeral registries.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Result, YggdrasilError};

/// Minimal key-value contract the durable index is written against.
pub trait BlobStore: Send + Sync {
    /// Persists `value` under `key`, replacing any previous value.
    fn assoc(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Loads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key`; absent keys are not an error.
    fn dissoc(&self, key: &str) -> Result<()>;
}

/// Directory-backed blob store: one file per key.
///
/// Writes go through a temporary file followed by a rename so a crash never
/// leaves a torn value behind.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory the store persists into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }
}

impl BlobStore for FileBlobStore {
    fn assoc(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        trace!(key, bytes = value.len(), "store.assoc");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(YggdrasilError::Storage(format!(
                "read of key {key:?} failed: {err}"
            ))),
        }
    }

    fn dissoc(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(YggdrasilError::Storage(format!(
                "remove of key {key:?} failed: {err}"
            ))),
        }
    }
}

/// In-memory blob store for ephemeral registries and tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    map: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn assoc(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn dissoc(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }
}

/// Maps an arbitrary key to a safe file name, injectively.
fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => {
                out.push('%');
                out.push_str(&format!("{other:02x}"));
            }
        }
    }
    out
}
