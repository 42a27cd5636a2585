//! In-memory cache, for tests and ephemeral runs.

use crate::cache::{BlobReader, Cache, CachedOutput};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::io::AsyncReadExt;

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCacheStats {
    /// Number of distinct blobs
    pub blob_count: usize,
    /// Total bytes held
    pub total_bytes: u64,
    /// Blob reads that hit
    pub read_count: u64,
    /// Blob writes that stored new content
    pub write_count: u64,
    /// Index pointers written
    pub entry_writes: u64,
}

/// Content cache held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryCache {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    entries: RwLock<HashMap<Digest, CachedOutput>>,
    stats: RwLock<MemoryCacheStats>,
}

impl MemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the statistics
    #[must_use]
    pub fn stats(&self) -> MemoryCacheStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a blob is present
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest)
    }

    /// Number of index pointers
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn insert_blob(&self, digest: &Digest, contents: Bytes) {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        if blobs.contains_key(digest) {
            return;
        }
        let size = contents.len() as u64;
        blobs.insert(digest.clone(), contents);

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.blob_count += 1;
        stats.total_bytes += size;
        stats.write_count += 1;
    }

    fn read_blob(&self, digest: &Digest) -> StoreResult<Bytes> {
        let blob = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                digest: digest.to_string(),
            })?;

        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .read_count += 1;
        Ok(blob)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn bytes(&self, digest: &Digest) -> StoreResult<Bytes> {
        self.read_blob(digest)
    }

    async fn blob(&self, digest: &Digest) -> StoreResult<BlobReader> {
        let contents = self.read_blob(digest)?;
        Ok(Box::pin(std::io::Cursor::new(contents)))
    }

    async fn blob_len(&self, digest: &Digest) -> StoreResult<u64> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StoreError::NotFound {
                digest: digest.to_string(),
            })
    }

    async fn write_bytes(&self, digest: &Digest, contents: Bytes) -> StoreResult<()> {
        self.insert_blob(digest, contents);
        Ok(())
    }

    async fn write_blob(&self, digest: &Digest, mut reader: BlobReader) -> StoreResult<()> {
        if self.contains(digest) {
            return Ok(());
        }
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        self.insert_blob(digest, Bytes::from(contents));
        Ok(())
    }

    async fn load_entry(&self, pointer: &Digest) -> StoreResult<Option<CachedOutput>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pointer)
            .cloned())
    }

    async fn store_entry(&self, pointers: &[Digest], output: &CachedOutput) -> StoreResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for pointer in pointers {
            if let Some(existing) = entries.get(pointer) {
                if existing.digest != output.digest {
                    tracing::warn!(
                        input = %pointer,
                        existing = %existing.digest,
                        output = %output.digest,
                        "non-determinism, overwriting pointer"
                    );
                }
            }
            entries.insert(pointer.clone(), output.clone());
        }
        drop(entries);

        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry_writes += pointers.len() as u64;
        Ok(())
    }
}
