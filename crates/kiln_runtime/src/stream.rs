//! Length-known byte streams.

use bytes::Bytes;
use kiln_core::Digest;
use kiln_storage::{BlobReader, Cache, StoreResult};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

#[derive(Clone)]
enum Source {
    Memory(Bytes),
    Cached { cache: Arc<dyn Cache>, digest: Digest },
}

/// A byte payload of known length that may live in memory or in the cache.
///
/// Streams loaded from the cache are not read until [`ByteStream::reader`]
/// or [`ByteStream::to_bytes`] is called.
#[derive(Clone)]
pub struct ByteStream {
    len: u64,
    source: Source,
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ByteStream");
        s.field("len", &self.len);
        if let Source::Cached { digest, .. } = &self.source {
            s.field("digest", digest);
        }
        s.finish()
    }
}

impl ByteStream {
    /// Stream over in-memory bytes
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            len: bytes.len() as u64,
            source: Source::Memory(bytes),
        }
    }

    pub(crate) fn cached(cache: Arc<dyn Cache>, digest: Digest, len: u64) -> Self {
        Self {
            len,
            source: Source::Cached { cache, digest },
        }
    }

    /// Length in bytes
    #[must_use]
    pub const fn content_length(&self) -> u64 {
        self.len
    }

    /// Digest of a stream backed by the cache; in-memory streams return `None`
    #[must_use]
    pub fn known_digest(&self) -> Option<&Digest> {
        match &self.source {
            Source::Memory(_) => None,
            Source::Cached { digest, .. } => Some(digest),
        }
    }

    pub(crate) fn in_memory(&self) -> Option<&Bytes> {
        match &self.source {
            Source::Memory(bytes) => Some(bytes),
            Source::Cached { .. } => None,
        }
    }

    /// Open the contents for reading
    ///
    /// # Errors
    ///
    /// Returns error if a cached blob cannot be opened
    pub async fn reader(&self) -> StoreResult<BlobReader> {
        match &self.source {
            Source::Memory(bytes) => Ok(Box::pin(Cursor::new(bytes.clone()))),
            Source::Cached { cache, digest } => cache.blob(digest).await,
        }
    }

    /// Read the whole contents
    ///
    /// # Errors
    ///
    /// Returns error if a cached blob cannot be read
    pub async fn to_bytes(&self) -> StoreResult<Bytes> {
        match &self.source {
            Source::Memory(bytes) => Ok(bytes.clone()),
            Source::Cached { cache, digest } => cache.bytes(digest).await,
        }
    }
}
