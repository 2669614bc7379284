//! The external collaborator the engine asks for file bytes and mtimes.
//! The engine never opens files itself — every read goes through this
//! trait so the same template can be evaluated against a local
//! filesystem, an object store, or a test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the engine needs to know about a bound file besides its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Last-modified time, same unit the caller's `FileInfo::mtime` uses.
    pub mtime: i64,
    pub size: u64,
}

/// One entry returned by [`FileStore::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Result type for file-store operations: an absent file is `Ok(None)`
/// rather than an error, so the engine can turn it into the one
/// recoverable [`crate::error::Error::MissingFile`] at the call site with
/// the source/path context the store itself doesn't know about.
pub type FileStoreResult<T> = Result<Option<T>, std::io::Error>;

/// External file access contract. Implementations may talk to a local
/// filesystem, an object store, or a synthetic in-memory fixture.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Current metadata for `path` within `source`, or `Ok(None)` if absent.
    async fn metadata(&self, source: &str, path: &str) -> FileStoreResult<FileMetadata>;

    /// Full contents of `path` within `source`, or `Ok(None)` if absent.
    async fn read(&self, source: &str, path: &str) -> FileStoreResult<Vec<u8>>;

    /// List entries directly under `path` within `source`.
    async fn list_dir(&self, source: &str, path: &str) -> FileStoreResult<Vec<DirEntry>>;

    /// Names of every source this store knows how to resolve.
    fn sources(&self) -> Vec<String>;
}
