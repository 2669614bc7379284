//! Evaluation cache: an in-memory primary store plus an optional
//! persistent backend keyed by [`Fingerprint`].
//!
//! The on-disk entry framing (magic bytes, format version, CRC32, length
//! prefix) is the same integrity-header shape used elsewhere in this crate
//! family for checkpoint-style data, adapted here to a single cached value.

use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The currency the engine caches: an opaque, action-produced value.
///
/// The engine never interprets this beyond passing it to/from an
/// [`crate::action::ActionDispatcher`] and the persistence layer.
pub type Value = serde_json::Value;

/// One cached result, timestamped for age-based eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// Unix epoch milliseconds at insertion time.
    pub created_at: i64,
    pub value: Value,
}

/// Storage backend for cached terminal values.
///
/// Object-safe so the engine can hold `Arc<dyn Cache>` and swap backends
/// without becoming generic over the cache implementation.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<Value>;
    async fn put(&self, fingerprint: Fingerprint, value: Value, created_at: i64);
    async fn invalidate(&self, fingerprint: &Fingerprint);
    /// Remove every entry with `created_at < cutoff`; returns the count removed.
    async fn evict_older_than(&self, cutoff: i64) -> usize;
    /// Remove least-recently-used entries until at most `max_entries` remain;
    /// returns the count removed. A no-op if already at or under the cap.
    async fn evict_lru_excess(&self, max_entries: usize) -> usize;
    async fn len(&self) -> usize;
}

/// Builds an unbounded recency tracker: `evict_lru_excess` enforces the cap
/// explicitly rather than relying on `lru::LruCache`'s own bounded eviction,
/// since entries must also be removed from the backing store they track.
fn recency_tracker() -> Mutex<LruCache<Fingerprint, ()>> {
    Mutex::new(LruCache::unbounded())
}

/// Pure in-memory cache backed by a sharded concurrent map, with an
/// LRU-ordered recency tracker alongside it for capacity-based eviction.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    recency: Mutex<LruCache<Fingerprint, ()>>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self { entries: DashMap::new(), recency: recency_tracker() }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        let value = self.entries.get(fingerprint).map(|e| e.value.clone());
        if value.is_some() {
            self.recency.lock().get(fingerprint);
        }
        value
    }

    async fn put(&self, fingerprint: Fingerprint, value: Value, created_at: i64) {
        self.recency.lock().put(fingerprint.clone(), ());
        self.entries.insert(
            fingerprint.clone(),
            CacheEntry { fingerprint, created_at, value },
        );
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
        self.recency.lock().pop(fingerprint);
    }

    async fn evict_older_than(&self, cutoff: i64) -> usize {
        let stale: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for fp in stale {
            self.entries.remove(&fp);
            self.recency.lock().pop(&fp);
        }
        count
    }

    async fn evict_lru_excess(&self, max_entries: usize) -> usize {
        let mut removed = 0;
        loop {
            let over_cap = self.recency.lock().len() > max_entries;
            if !over_cap {
                break;
            }
            let Some((fp, _)) = self.recency.lock().pop_lru() else { break };
            self.entries.remove(&fp);
            removed += 1;
        }
        removed
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}

const CACHE_MAGIC: &[u8; 4] = b"SFCH";
const CACHE_FORMAT_VERSION: u8 = 1;

/// Persistent cache: an in-memory index backed by write-through files on
/// disk, one per fingerprint, named by its hex digest.
///
/// If `base_dir` cannot be created at construction time, falls back to
/// behaving as a pure in-memory cache (logged once at `warn`), per the
/// engine's tolerance for a degraded but non-fatal persistence layer.
#[derive(Debug)]
pub struct FileCache {
    dir: Option<PathBuf>,
    memory: DashMap<Fingerprint, CacheEntry>,
    recency: Mutex<LruCache<Fingerprint, ()>>,
}

impl FileCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let dir = match std::fs::create_dir_all(&base_dir) {
            Ok(()) => Some(base_dir),
            Err(e) => {
                warn!(error = %e, path = %base_dir.display(), "persistent cache directory unavailable, falling back to in-memory only");
                None
            }
        };
        Self { dir, memory: DashMap::new(), recency: recency_tracker() }
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.cache", fingerprint.0)))
    }

    fn write_entry(path: &Path, entry: &CacheEntry) -> io::Result<()> {
        let payload = bincode::serialize(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(4 + 1 + 4 + 8 + payload.len());
        buf.extend_from_slice(CACHE_MAGIC);
        buf.push(CACHE_FORMAT_VERSION);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);

        std::fs::write(path, buf)
    }

    fn read_entry(path: &Path) -> io::Result<CacheEntry> {
        let buf = std::fs::read(path)?;
        if buf.len() < 17 || &buf[0..4] != CACHE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad cache entry magic"));
        }
        if buf[4] != CACHE_FORMAT_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported cache entry version"));
        }
        let crc = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let len = u64::from_le_bytes(buf[9..17].try_into().unwrap()) as usize;
        let payload = &buf[17..];
        if payload.len() != len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "cache entry length mismatch"));
        }
        if crc32fast::hash(payload) != crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "cache entry CRC mismatch"));
        }
        bincode::deserialize(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        if let Some(entry) = self.memory.get(fingerprint) {
            let value = entry.value.clone();
            drop(entry);
            self.recency.lock().get(fingerprint);
            return Some(value);
        }
        let path = self.path_for(fingerprint)?;
        match Self::read_entry(&path) {
            Ok(entry) => {
                let value = entry.value.clone();
                self.memory.insert(fingerprint.clone(), entry);
                self.recency.lock().put(fingerprint.clone(), ());
                Some(value)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, fingerprint = %fingerprint, "discarding unreadable persistent cache entry");
                None
            }
        }
    }

    async fn put(&self, fingerprint: Fingerprint, value: Value, created_at: i64) {
        let entry = CacheEntry { fingerprint: fingerprint.clone(), created_at, value };
        if let Some(path) = self.path_for(&fingerprint) {
            if let Err(e) = Self::write_entry(&path, &entry) {
                warn!(error = %e, fingerprint = %fingerprint, "failed to persist cache entry, keeping in-memory copy only");
            }
        }
        self.recency.lock().put(fingerprint.clone(), ());
        self.memory.insert(fingerprint, entry);
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) {
        self.memory.remove(fingerprint);
        self.recency.lock().pop(fingerprint);
        if let Some(path) = self.path_for(fingerprint) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(error = %e, fingerprint = %fingerprint, "failed to remove persistent cache entry");
                }
            }
        }
    }

    async fn evict_older_than(&self, cutoff: i64) -> usize {
        let stale: Vec<Fingerprint> = self
            .memory
            .iter()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for fp in &stale {
            self.invalidate(fp).await;
        }
        stale.len()
    }

    async fn evict_lru_excess(&self, max_entries: usize) -> usize {
        let mut removed = 0;
        loop {
            let over_cap = self.recency.lock().len() > max_entries;
            if !over_cap {
                break;
            }
            let Some((fp, _)) = self.recency.lock().pop_lru() else { break };
            self.invalidate(&fp).await;
            removed += 1;
        }
        removed
    }

    async fn len(&self) -> usize {
        self.memory.len()
    }
}

/// Shared handle type the engine holds: swap backends without changing callers.
pub type SharedCache = Arc<dyn Cache>;
