//! Filesystem-backed cache.
//!
//! Layout under `<root>/blobs`:
//! - `<algorithm>/<hex>`: blob contents
//! - `index/<algorithm>-<hex>.json`: one [`CachedOutput`] per pointer digest
//!
//! Writers never expose partial files: content goes to a uniquely-named
//! temporary file next to its destination and is renamed into place, so
//! concurrent writers of the same digest are safe.

use crate::cache::{BlobReader, Cache, CachedOutput};
use crate::config::CacheConfig;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::{Digest, DigestAlgorithm, Digester};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const INDEX_DIR: &str = "index";
const COPY_BUF_LEN: usize = 64 * 1024;

/// Persistent content cache backed by the local filesystem
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
    verify_writes: bool,
}

impl LocalCache {
    /// Open (creating if needed) a cache at `config.root`
    ///
    /// # Errors
    ///
    /// Returns error if the directories cannot be created
    pub async fn open(config: &CacheConfig) -> StoreResult<Self> {
        let dir = config.blobs_dir();
        tokio::fs::create_dir_all(dir.join(DigestAlgorithm::Sha256.as_str())).await?;
        tokio::fs::create_dir_all(dir.join(INDEX_DIR)).await?;

        Ok(Self {
            dir,
            verify_writes: config.verify_writes,
        })
    }

    /// Directory holding blobs and the index
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.algorithm().as_str()).join(digest.hex())
    }

    fn index_path(&self, pointer: &Digest) -> PathBuf {
        self.dir
            .join(INDEX_DIR)
            .join(format!("{}-{}.json", pointer.algorithm(), pointer.hex()))
    }

    async fn verify_existing(&self, path: &Path, expected: &Digest) -> StoreResult<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut digester = Digester::new(expected.algorithm());
        let mut buf = vec![0u8; COPY_BUF_LEN];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        check_digest(expected, digester.finish())
    }
}

fn check_digest(expected: &Digest, actual: Digest) -> StoreResult<()> {
    if actual != *expected {
        return Err(StoreError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, Uuid::new_v4().simple()))
}

/// Copy `reader` into `file`, hashing what goes through.
async fn copy_hashing(
    mut reader: BlobReader,
    file: &mut tokio::fs::File,
    algorithm: DigestAlgorithm,
) -> StoreResult<Digest> {
    let mut digester = Digester::new(algorithm);
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    Ok(digester.finish())
}

#[async_trait]
impl Cache for LocalCache {
    async fn bytes(&self, digest: &Digest) -> StoreResult<Bytes> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn blob(&self, digest: &Digest) -> StoreResult<BlobReader> {
        match tokio::fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn blob_len(&self, digest: &Digest) -> StoreResult<u64> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_bytes(&self, digest: &Digest, contents: Bytes) -> StoreResult<()> {
        self.write_blob(digest, Box::pin(std::io::Cursor::new(contents)))
            .await
    }

    async fn write_blob(&self, digest: &Digest, reader: BlobReader) -> StoreResult<()> {
        let path = self.blob_path(digest);

        if tokio::fs::metadata(&path).await.is_ok() {
            if self.verify_writes {
                return self.verify_existing(&path, digest).await;
            }
            // Already present; the reader is dropped unread.
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_sibling(&path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let copied = copy_hashing(reader, &mut file, digest.algorithm()).await;
        drop(file);

        let actual = match copied {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
        };

        if self.verify_writes {
            if let Err(err) = check_digest(digest, actual) {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
        }

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_entry(&self, pointer: &Digest) -> StoreResult<Option<CachedOutput>> {
        let contents = match tokio::fs::read(self.index_path(pointer)).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let output = serde_json::from_slice(&contents).map_err(|e| StoreError::Corrupt {
            reason: format!("failed to decode cached entry: {}", e),
        })?;
        Ok(Some(output))
    }

    async fn store_entry(&self, pointers: &[Digest], output: &CachedOutput) -> StoreResult<()> {
        if pointers.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.dir.join(INDEX_DIR)).await?;
        let marshalled = serde_json::to_vec(output)?;

        for pointer in pointers {
            let index_file = self.index_path(pointer);

            if let Ok(existing) = tokio::fs::read(&index_file).await {
                if let Ok(existing) = serde_json::from_slice::<CachedOutput>(&existing) {
                    if existing.digest != output.digest {
                        tracing::warn!(
                            input = %pointer,
                            existing = %existing.digest,
                            output = %output.digest,
                            "non-determinism, overwriting pointer"
                        );
                    }
                }
            }

            let tmp = temp_sibling(&index_file);
            tokio::fs::write(&tmp, &marshalled).await?;
            tokio::fs::rename(&tmp, &index_file).await?;
        }

        Ok(())
    }
}

/// Delete the whole local cache rooted at `config.root`
///
/// # Errors
///
/// Returns error if removal fails for a reason other than the cache not existing
pub async fn prune(config: &CacheConfig) -> StoreResult<()> {
    tracing::info!(root = %config.root.display(), "pruning cache");
    match tokio::fs::remove_dir_all(&config.root).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    struct CountingReader {
        inner: std::io::Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            this.reads.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }

    async fn open_temp() -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(&CacheConfig::at(dir.path())).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_write_read_bytes() {
        let (_dir, cache) = open_temp().await;
        let data = Bytes::from_static(b"hello world");
        let digest = Digest::of_bytes(&data);

        cache.write_bytes(&digest, data.clone()).await.unwrap();
        assert_eq!(cache.bytes(&digest).await.unwrap(), data);
        assert_eq!(cache.blob_len(&digest).await.unwrap(), data.len() as u64);

        let mut reader = cache.blob(&digest).await.unwrap();
        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, data.to_vec());
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let (_dir, cache) = open_temp().await;
        let err = cache.bytes(&Digest::of_bytes(b"absent")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.blob(&Digest::of_bytes(b"absent")).await.is_err());
    }

    #[tokio::test]
    async fn test_existing_blob_is_not_reread() {
        let (_dir, cache) = open_temp().await;
        let data = b"payload".to_vec();
        let digest = Digest::of_bytes(&data);
        let reads = Arc::new(AtomicUsize::new(0));

        let reader = CountingReader {
            inner: std::io::Cursor::new(data.clone()),
            reads: reads.clone(),
        };
        cache.write_blob(&digest, Box::pin(reader)).await.unwrap();
        let first = reads.load(Ordering::SeqCst);
        assert!(first > 0);

        let reader = CountingReader {
            inner: std::io::Cursor::new(data),
            reads: reads.clone(),
        };
        cache.write_blob(&digest, Box::pin(reader)).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), first);
    }

    #[tokio::test]
    async fn test_verify_writes_rejects_wrong_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::at(dir.path()).with_verify_writes(true);
        let cache = LocalCache::open(&config).await.unwrap();

        let digest = Digest::of_bytes(b"expected");
        let err = cache
            .write_bytes(&digest, Bytes::from_static(b"something else"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(cache.bytes(&digest).await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (_dir, cache) = open_temp().await;
        let data = Bytes::from_static(b"tidy");
        let digest = Digest::of_bytes(&data);
        cache.write_bytes(&digest, data).await.unwrap();

        let mut entries = tokio::fs::read_dir(cache.dir().join("sha256")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().starts_with('.'));
        }
    }

    #[tokio::test]
    async fn test_store_and_load_entry() {
        let (_dir, cache) = open_temp().await;
        let pre = Digest::of_bytes(b"pre");
        let post = Digest::of_bytes(b"post");
        let output = CachedOutput::new(Digest::of_bytes(b"out"), Utc::now());

        cache.store_entry(&[pre.clone(), post.clone()], &output).await.unwrap();
        assert_eq!(cache.load_entry(&pre).await.unwrap(), Some(output.clone()));
        assert_eq!(cache.load_entry(&post).await.unwrap(), Some(output.clone()));

        // Storing again is harmless.
        cache.store_entry(&[pre.clone()], &output).await.unwrap();
        assert_eq!(cache.load_entry(&pre).await.unwrap(), Some(output));
    }

    #[tokio::test]
    async fn test_store_entry_without_pointers_is_noop() {
        let (_dir, cache) = open_temp().await;
        let output = CachedOutput::new(Digest::of_bytes(b"out"), Utc::now());
        cache.store_entry(&[], &output).await.unwrap();

        let mut entries = tokio::fs::read_dir(cache.dir().join("index")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_error() {
        let (_dir, cache) = open_temp().await;
        let pointer = Digest::of_bytes(b"pointer");
        tokio::fs::write(cache.index_path(&pointer), b"{not json").await.unwrap();
        assert!(matches!(
            cache.load_entry(&pointer).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::at(dir.path().join("cache"));
        let cache = LocalCache::open(&config).await.unwrap();
        let data = Bytes::from_static(b"gone soon");
        cache.write_bytes(&Digest::of_bytes(&data), data).await.unwrap();

        prune(&config).await.unwrap();
        assert!(!config.root.exists());
        // Pruning twice is fine.
        prune(&config).await.unwrap();
    }
}
