use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Durable append-oriented object store, addressed by string keys.
///
/// The production deployment fronts a remote bucket; that wire protocol is
/// not this crate's concern, so the boundary is a pair of blob calls.
pub trait BlobStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed store: keys become paths under a root directory.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for DirStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        std::fs::write(&path, body)
            .with_context(|| format!("writing store object {}", path.display()))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        std::fs::read(&path).with_context(|| format!("reading store object {}", path.display()))
    }
}

/// In-memory store, for tests and dry runs.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for MemStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .with_context(|| format!("no such object: {key}"))
    }
}

/// Writes with bounded retry and exponential backoff.
///
/// Telemetry writes hit a remote store with fixed per-call overhead and the
/// occasional transient failure; a handful of retries rides those out. The
/// final error still propagates.
pub fn put_with_retry(
    store: &dyn BlobStore,
    key: &str,
    body: &[u8],
    max_attempts: u32,
) -> Result<()> {
    assert!(max_attempts > 0);
    let mut backoff = Duration::from_millis(100);
    for attempt in 1..=max_attempts {
        match store.put(key, body) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < max_attempts => {
                warn!("store write of {key} failed (attempt {attempt}/{max_attempts}): {err:#}");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("store write of {key} failed after {max_attempts} attempts"))
            }
        }
    }
    unreachable!("retry loop returns on every path")
}
