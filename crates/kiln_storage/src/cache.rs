//! The cache backend contract.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kiln_core::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// A readable blob stream
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Index record: what a pointer digest resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    /// Digest of the cached output blob(s)
    pub digest: Digest,
    /// When the output was originally produced
    pub timestamp: DateTime<Utc>,
    /// Cache format version at the time of writing
    pub cache_version: u32,
    /// Input digests that were known when the entry was written
    #[serde(default)]
    pub input_digests: BTreeMap<String, String>,
    /// Provenance, for debugging only
    #[serde(default)]
    pub debug: CachedOutputDebug,
}

impl CachedOutput {
    /// Create a record for `digest` produced at `timestamp`
    #[must_use]
    pub fn new(digest: Digest, timestamp: DateTime<Utc>) -> Self {
        Self {
            digest,
            timestamp,
            cache_version: kiln_core::CACHE_VERSION,
            input_digests: BTreeMap::new(),
            debug: CachedOutputDebug::default(),
        }
    }
}

/// Provenance attached to a [`CachedOutput`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutputDebug {
    /// Per-type serial of the producing computable
    pub serial: i64,
    /// Module of the producing type
    pub module_path: String,
    /// Name of the producing type
    pub type_name: String,
}

/// Content-addressed cache.
///
/// Blob writes are idempotent: a blob that already exists under a digest is
/// left untouched. `store_entry` with no pointers is a no-op.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a whole blob
    async fn bytes(&self, digest: &Digest) -> StoreResult<Bytes>;

    /// Open a blob for streaming
    async fn blob(&self, digest: &Digest) -> StoreResult<BlobReader>;

    /// Size of a stored blob in bytes
    async fn blob_len(&self, digest: &Digest) -> StoreResult<u64>;

    /// Write a blob from memory
    async fn write_bytes(&self, digest: &Digest, contents: Bytes) -> StoreResult<()>;

    /// Write a blob from a stream
    async fn write_blob(&self, digest: &Digest, reader: BlobReader) -> StoreResult<()>;

    /// Look up the output a pointer digest maps to
    async fn load_entry(&self, pointer: &Digest) -> StoreResult<Option<CachedOutput>>;

    /// Map every pointer digest to `output`
    async fn store_entry(&self, pointers: &[Digest], output: &CachedOutput) -> StoreResult<()>;
}
