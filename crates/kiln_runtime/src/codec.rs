//! Per-type strategies for digesting and caching computed values.
//!
//! The orchestrator only sees type-erased values, so it finds the codec for
//! a value through the [`CodecRegistry`] by the value's [`TypeId`]. Codecs
//! are registered through trait-bounded helpers: a type that implements
//! `Serialize` gets a codec by declaring so at startup.
//!
//! Capabilities ([`Digestible`], [`Versioned`]) are declared the same way,
//! per concrete type, and are kept apart from codecs. Lookup tries the
//! type's own codec first and falls back to its declared capability, so a
//! type with a real codec keeps it whatever capabilities it also declares.

use crate::builtin::{BytesCodec, MessageCodec, StreamCodec, VecCodec};
use crate::promise::{AnyValue, Computed};
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::Digest;
use kiln_storage::Cache;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Stores and loads values of type `V` in a content-addressed cache.
///
/// `cache(v) = d` must imply that `load_cached(d)` yields a value whose
/// `compute_digest` is `d`.
#[async_trait]
pub trait Codec<V: Send + Sync + 'static>: Send + Sync + 'static {
    /// Digest of `value`
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be digested
    fn compute_digest(&self, value: &V) -> anyhow::Result<Digest>;

    /// Load the value stored under `digest`
    ///
    /// # Errors
    ///
    /// Returns error if the value is missing or cannot be decoded
    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<V>;

    /// Store `value` and return its digest
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be written
    async fn cache(&self, cache: &Arc<dyn Cache>, value: &V) -> anyhow::Result<Digest>;
}

/// A value that can describe itself with a digest
pub trait Digestible {
    /// Digest of the value
    ///
    /// # Errors
    ///
    /// Returns error if the digest cannot be produced
    fn compute_digest(&self) -> anyhow::Result<Digest>;
}

impl Digestible for Digest {
    fn compute_digest(&self) -> anyhow::Result<Digest> {
        Ok(self.clone())
    }
}

/// Receives new versions of a [`Versioned`] value
#[derive(Clone)]
pub struct VersionSender {
    publish: Arc<dyn Fn(Computed<AnyValue>, bool) + Send + Sync>,
}

impl fmt::Debug for VersionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionSender").finish_non_exhaustive()
    }
}

impl VersionSender {
    pub(crate) fn new(publish: impl Fn(Computed<AnyValue>, bool) + Send + Sync + 'static) -> Self {
        Self {
            publish: Arc::new(publish),
        }
    }

    /// Publish a new version
    pub fn publish<V: Any + Send + Sync>(&self, value: V, digest: Option<Digest>) {
        (self.publish)(Computed::erase(Computed::new(value, digest)), false);
    }

    /// Publish the final version; no more will follow
    pub fn publish_last<V: Any + Send + Sync>(&self, value: V, digest: Option<Digest>) {
        (self.publish)(Computed::erase(Computed::new(value, digest)), true);
    }
}

/// A value that keeps producing new versions of itself, such as a live
/// view of a directory.
pub trait Versioned: Send + Sync + 'static {
    /// Start delivering versions to `versions`. Cancelling the returned
    /// token stops delivery.
    ///
    /// # Errors
    ///
    /// Returns error if observation could not start
    fn observe(&self, versions: VersionSender) -> anyhow::Result<CancellationToken>;
}

#[async_trait]
pub(crate) trait ErasedCodec: Send + Sync {
    fn value_type_name(&self) -> &'static str;

    fn can_store(&self) -> bool;

    fn compute_digest(&self, value: &AnyValue) -> anyhow::Result<Digest>;

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<AnyValue>;

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &AnyValue) -> anyhow::Result<Digest>;
}

fn downcast_value<V: Any>(value: &AnyValue) -> anyhow::Result<&V> {
    (**value)
        .downcast_ref::<V>()
        .ok_or_else(|| anyhow::anyhow!("value is not a {}", std::any::type_name::<V>()))
}

struct TypedCodec<V, C> {
    codec: C,
    _value: PhantomData<fn() -> V>,
}

#[async_trait]
impl<V, C> ErasedCodec for TypedCodec<V, C>
where
    V: Send + Sync + 'static,
    C: Codec<V>,
{
    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<V>()
    }

    fn can_store(&self) -> bool {
        true
    }

    fn compute_digest(&self, value: &AnyValue) -> anyhow::Result<Digest> {
        self.codec.compute_digest(downcast_value::<V>(value)?)
    }

    async fn load_cached(&self, cache: &Arc<dyn Cache>, digest: &Digest) -> anyhow::Result<AnyValue> {
        let value = self.codec.load_cached(cache, digest).await?;
        Ok(Arc::new(value) as AnyValue)
    }

    async fn cache(&self, cache: &Arc<dyn Cache>, value: &AnyValue) -> anyhow::Result<Digest> {
        self.codec.cache(cache, downcast_value::<V>(value)?).await
    }
}

/// Digest-only support for [`Digestible`] values; they are never stored.
struct DigestOnly<V> {
    _value: PhantomData<fn() -> V>,
}

#[async_trait]
impl<V> ErasedCodec for DigestOnly<V>
where
    V: Digestible + Send + Sync + 'static,
{
    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<V>()
    }

    fn can_store(&self) -> bool {
        false
    }

    fn compute_digest(&self, value: &AnyValue) -> anyhow::Result<Digest> {
        downcast_value::<V>(value)?.compute_digest()
    }

    async fn load_cached(&self, _cache: &Arc<dyn Cache>, _digest: &Digest) -> anyhow::Result<AnyValue> {
        anyhow::bail!("{} cannot be loaded from the cache", std::any::type_name::<V>())
    }

    async fn cache(&self, _cache: &Arc<dyn Cache>, _value: &AnyValue) -> anyhow::Result<Digest> {
        anyhow::bail!("{} cannot be stored in the cache", std::any::type_name::<V>())
    }
}

type VersionedCast = for<'a> fn(&'a (dyn Any + Send + Sync)) -> Option<&'a dyn Versioned>;

fn as_versioned<V: Versioned>(value: &(dyn Any + Send + Sync)) -> Option<&dyn Versioned> {
    value.downcast_ref::<V>().map(|v| v as &dyn Versioned)
}

static GLOBAL: Lazy<RwLock<Arc<CodecRegistry>>> =
    Lazy::new(|| RwLock::new(Arc::new(CodecRegistry::with_builtins())));

/// Maps value types to their codecs and capabilities
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<TypeId, Arc<dyn ErasedCodec>>>,
    digestible: RwLock<HashMap<TypeId, Arc<dyn ErasedCodec>>>,
    versioned: RwLock<HashMap<TypeId, VersionedCast>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |codecs: &RwLock<HashMap<TypeId, Arc<dyn ErasedCodec>>>| {
            let codecs = codecs.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&'static str> = codecs.values().map(|c| c.value_type_name()).collect();
            names.sort_unstable();
            names
        };
        f.debug_struct("CodecRegistry")
            .field("codecs", &names(&self.codecs))
            .field("digestible", &names(&self.digestible))
            .finish()
    }
}

impl CodecRegistry {
    /// Registry without any codec
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with codecs for [`Bytes`], `Vec<u8>`, [`ByteStream`] and `String`
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register::<Bytes, _>(BytesCodec);
        registry.register::<Vec<u8>, _>(VecCodec);
        registry.register::<ByteStream, _>(StreamCodec);
        registry.register_message::<String>();
        registry
    }

    /// Process-wide registry, used by orchestrators built without one
    #[must_use]
    pub fn global() -> Arc<Self> {
        GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the process-wide registry with a fresh one holding only the
    /// builtins. Orchestrators already built keep their registry.
    pub fn reset_global() {
        *GLOBAL.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Self::with_builtins());
    }

    /// Register `codec` for values of type `V`, replacing any previous one
    pub fn register<V, C>(&self, codec: C)
    where
        V: Send + Sync + 'static,
        C: Codec<V>,
    {
        self.insert::<V>(Arc::new(TypedCodec {
            codec,
            _value: PhantomData,
        }));
    }

    /// Store `V` as its canonical JSON encoding
    pub fn register_message<V>(&self)
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<V, _>(MessageCodec::<V>::new());
    }

    /// Declare that `V` is [`Digestible`]. Values of a type with no codec of
    /// its own are then digested, but never stored.
    pub fn register_digestible<V>(&self)
    where
        V: Digestible + Send + Sync + 'static,
    {
        self.digestible
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<V>(), Arc::new(DigestOnly::<V> { _value: PhantomData }));
    }

    /// Declare that `V` produces versions of itself
    pub fn register_versioned<V: Versioned>(&self) {
        self.versioned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<V>(), as_versioned::<V>);
    }

    fn insert<V: 'static>(&self, codec: Arc<dyn ErasedCodec>) {
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<V>(), codec);
    }

    /// Whether values of type `V` have a codec
    #[must_use]
    pub fn contains<V: 'static>(&self) -> bool {
        self.lookup(TypeId::of::<V>()).is_some()
    }

    pub(crate) fn lookup(&self, type_id: TypeId) -> Option<Arc<dyn ErasedCodec>> {
        let exact = self
            .codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned();
        exact.or_else(|| {
            self.digestible
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&type_id)
                .cloned()
        })
    }

    /// Whether `value` was declared [`Versioned`]; returns the capability
    pub(crate) fn versioned<'a>(&self, value: &'a AnyValue) -> Option<&'a dyn Versioned> {
        let inner: &'a (dyn Any + Send + Sync) = &**value;
        let cast = self
            .versioned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Any::type_id(inner))
            .copied()?;
        cast(inner)
    }

    /// Digest `value` with its registered codec
    ///
    /// # Errors
    ///
    /// Returns error if there is no codec for `V` or digesting fails
    pub fn digest_of<V: Any + Send + Sync>(&self, value: V) -> anyhow::Result<Digest> {
        let codec = self.codec_for::<V>()?;
        codec.compute_digest(&(Arc::new(value) as AnyValue))
    }

    /// Store `value` with its registered codec
    ///
    /// # Errors
    ///
    /// Returns error if there is no codec for `V` or storing fails
    pub async fn store<V: Any + Send + Sync>(
        &self,
        cache: &Arc<dyn Cache>,
        value: V,
    ) -> anyhow::Result<Digest> {
        let codec = self.codec_for::<V>()?;
        codec.cache(cache, &(Arc::new(value) as AnyValue)).await
    }

    /// Load a `V` with its registered codec
    ///
    /// # Errors
    ///
    /// Returns error if there is no codec for `V` or loading fails
    pub async fn load<V: Any + Clone + Send + Sync>(
        &self,
        cache: &Arc<dyn Cache>,
        digest: &Digest,
    ) -> anyhow::Result<V> {
        let codec = self.codec_for::<V>()?;
        let value = codec.load_cached(cache, digest).await?;
        value
            .downcast::<V>()
            .map(Arc::unwrap_or_clone)
            .map_err(|_| anyhow::anyhow!("codec produced another type than {}", std::any::type_name::<V>()))
    }

    fn codec_for<V: 'static>(&self) -> anyhow::Result<Arc<dyn ErasedCodec>> {
        self.lookup(TypeId::of::<V>())
            .ok_or_else(|| anyhow::anyhow!("no codec registered for {}", std::any::type_name::<V>()))
    }
}
