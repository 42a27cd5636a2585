//! Built-in codecs.

use crate::codec::Codec;
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::Digest;
use kiln_storage::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Raw [`Bytes`] payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

#[async_trait]
impl Codec<Bytes> for BytesCodec {
    fn compute_digest(&self, value: &Bytes) -> anyhow::Result<Digest> {
        Ok(Digest::of_bytes(value))
    }

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<Bytes> {
        Ok(cache.bytes(digest).await?)
    }

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &Bytes) -> anyhow::Result<Digest> {
        let digest = Digest::of_bytes(value);
        cache.write_bytes(&digest, value.clone()).await?;
        Ok(digest)
    }
}

/// Raw `Vec<u8>` payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct VecCodec;

#[async_trait]
impl Codec<Vec<u8>> for VecCodec {
    fn compute_digest(&self, value: &Vec<u8>) -> anyhow::Result<Digest> {
        Ok(Digest::of_bytes(value))
    }

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<Vec<u8>> {
        Ok(cache.bytes(digest).await?.to_vec())
    }

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &Vec<u8>) -> anyhow::Result<Digest> {
        let digest = Digest::of_bytes(value);
        cache.write_bytes(&digest, Bytes::copy_from_slice(value)).await?;
        Ok(digest)
    }
}

/// [`ByteStream`]s; loading only records the digest and length
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCodec;

#[async_trait]
impl Codec<ByteStream> for StreamCodec {
    fn compute_digest(&self, value: &ByteStream) -> anyhow::Result<Digest> {
        if let Some(digest) = value.known_digest() {
            return Ok(digest.clone());
        }
        let bytes = value
            .in_memory()
            .ok_or_else(|| anyhow::anyhow!("stream has neither a digest nor in-memory contents"))?;
        Ok(Digest::of_bytes(bytes))
    }

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<ByteStream> {
        let len = cache.blob_len(digest).await?;
        Ok(ByteStream::cached(cache.clone(), digest.clone(), len))
    }

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &ByteStream) -> anyhow::Result<Digest> {
        let digest = match value.known_digest() {
            Some(digest) => digest.clone(),
            None => Digest::of_bytes(&value.to_bytes().await?),
        };
        cache.write_blob(&digest, value.reader().await?).await?;
        Ok(digest)
    }
}

/// Serializable values, stored as canonical JSON.
///
/// The encoding goes through `serde_json::Value`, so map keys are sorted and
/// the stored bytes are exactly what the digest was computed over.
pub struct MessageCodec<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> MessageCodec<V> {
    /// Codec for `V`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for MessageCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for MessageCodec<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCodec<{}>", std::any::type_name::<V>())
    }
}

fn encode<V: Serialize>(value: &V) -> anyhow::Result<Vec<u8>> {
    let canonical = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&canonical)?)
}

#[async_trait]
impl<V> Codec<V> for MessageCodec<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn compute_digest(&self, value: &V) -> anyhow::Result<Digest> {
        Ok(Digest::of_bytes(&encode(value)?))
    }

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<V> {
        let bytes = cache.bytes(digest).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &V) -> anyhow::Result<Digest> {
        let encoded = encode(value)?;
        let digest = Digest::of_bytes(&encoded);
        cache.write_bytes(&digest, Bytes::from(encoded)).await?;
        Ok(digest)
    }
}
