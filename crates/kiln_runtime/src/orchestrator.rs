//! Sequencing, deduplication and caching of computable executions.
//!
//! An [`Orchestrator`] owns the long-lived pieces: the cache backend, the
//! codec registry, configuration and throttle. Each call to
//! [`Orchestrator::run`] opens an invocation with its own promise registry
//! and pool of background work; computables are resolved through the
//! [`Context`] handed to the invocation body.

use crate::action::Action;
use crate::codec::{CodecRegistry, ErasedCodec};
use crate::computable::{AnyComputable, Computable, Resolved, Scope, short_type_name};
use crate::config::OrchestratorConfig;
use crate::error::{ComputeError, ComputeResult};
use crate::inputs::ComputedInputs;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::promise::{AnyValue, Computed, Future, Promise};
use crate::throttle::Throttle;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::{ActionId, Digest};
use kiln_storage::{Cache, CacheConfig, CachedOutput, CachedOutputDebug, LocalCache, StoreResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

struct OrchestratorInner {
    cache: Arc<dyn Cache>,
    codecs: Arc<CodecRegistry>,
    config: OrchestratorConfig,
    throttle: Arc<Throttle>,
    metrics: Metrics,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    cache: Arc<dyn Cache>,
    codecs: Option<Arc<CodecRegistry>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Use `config`
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `codecs` instead of the process-wide registry
    #[must_use]
    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Build the orchestrator
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let throttle = Arc::new(Throttle::new(self.config.throttle.clone()));
        Orchestrator {
            inner: Arc::new(OrchestratorInner {
                cache: self.cache,
                codecs: self.codecs.unwrap_or_else(CodecRegistry::global),
                config: self.config,
                throttle,
                metrics: Metrics::new(),
            }),
        }
    }
}

/// Runs invocations against a cache
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("codecs", &self.inner.codecs)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator over `cache`
    #[must_use]
    pub fn builder(cache: Arc<dyn Cache>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            cache,
            codecs: None,
            config: OrchestratorConfig::default(),
        }
    }

    /// Orchestrator with default configuration
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self::builder(cache).build()
    }

    /// Orchestrator over a [`LocalCache`] at `cache_config`
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be created
    pub async fn local(cache_config: &CacheConfig, config: OrchestratorConfig) -> StoreResult<Self> {
        let cache = LocalCache::open(cache_config).await?;
        Ok(Self::builder(Arc::new(cache)).with_config(config).build())
    }

    /// Cache backend
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.inner.cache
    }

    /// Codec registry
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Counters across all invocations
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Run `body` as a top-level invocation.
    ///
    /// Once the body returns, waits for all background work, then runs every
    /// registered cleanup.
    ///
    /// # Errors
    ///
    /// Returns the body's error; otherwise the first failure of
    /// non-best-effort background work, or the first cleanup failure.
    pub async fn run<T, F, Fut>(&self, body: F) -> ComputeResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = ComputeResult<T>>,
    {
        self.run_with(CancellationToken::new(), body).await
    }

    /// Run `body` as a top-level invocation that stops when `cancel` fires
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::run`]
    pub async fn run_with<T, F, Fut>(&self, cancel: CancellationToken, body: F) -> ComputeResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = ComputeResult<T>>,
    {
        let invocation = Arc::new(Invocation {
            orch: self.inner.clone(),
            promises: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            cancel,
            cleanups: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        });

        let result = body(invocation.root()).await;

        invocation.tasks.close();
        invocation.tasks.wait().await;

        let cleanup_err = invocation.run_cleanups().await;
        invocation.tasks.wait().await;

        let value = result?;
        if let Some(err) = invocation.take_failure() {
            return Err(err);
        }
        if let Some(err) = cleanup_err {
            return Err(err);
        }
        Ok(value)
    }
}

type CleanupFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Invocation {
    orch: Arc<OrchestratorInner>,
    promises: Mutex<HashMap<Digest, Promise<AnyValue>>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    cleanups: Mutex<Vec<(Action, CleanupFn)>>,
    failure: Mutex<Option<ComputeError>>,
}

impl Invocation {
    fn root(self: &Arc<Self>) -> Context {
        Context {
            invocation: self.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn detached(self: &Arc<Self>) -> Context {
        Context {
            invocation: self.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// The promise registered for `digest`, or a new one. A promise that
    /// ended in cancellation is replaced.
    fn shared_promise(&self, digest: &Digest) -> (Promise<AnyValue>, bool) {
        let mut promises = self.promises.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = promises.get(digest) {
            let cancelled = matches!(existing.peek(), Some(Err(ref e)) if e.is_cancelled());
            if !cancelled {
                return (existing.clone(), false);
            }
        }

        let promise = Promise::new(ActionId::new());
        promises.insert(digest.clone(), promise.clone());
        (promise, true)
    }

    fn record_failure(&self, err: ComputeError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn take_failure(&self) -> Option<ComputeError> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    async fn run_cleanups(self: &Arc<Self>) -> Option<ComputeError> {
        let cleanups: Vec<_> = self
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut first = None;
        for (action, cleanup) in cleanups {
            let span = action.span(ActionId::new(), "cleanup");
            if let Err(err) = cleanup(self.detached()).instrument(span).await {
                tracing::warn!(action = %action, error = %format!("{err:#}"), "cleanup failed");
                if first.is_none() {
                    first = Some(ComputeError::compute(action.name(), err));
                }
            }
        }
        first
    }
}

/// Result found in the cache for a pointer digest
pub(crate) struct CacheHit {
    pub(crate) computed: Computed<AnyValue>,
    output_digest: Digest,
    input: Digest,
}

/// How outputs of one computable are cached
pub(crate) struct CachePolicy {
    codec: Option<Arc<dyn ErasedCodec>>,
    should_cache: bool,
    verify: bool,
}

impl CachePolicy {
    pub(crate) fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub(crate) fn verify(&self) -> bool {
        self.verify
    }
}

/// Handle on the current invocation, passed to every compute function.
///
/// Cloning is cheap. Each context carries its own cancellation token; waits
/// performed through it stop when the token fires.
#[derive(Clone)]
pub struct Context {
    invocation: Arc<Invocation>,
    cancel: CancellationToken,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Resolve `computable`, computing it at most once per digest (or per
    /// instance) within the invocation.
    ///
    /// # Errors
    ///
    /// Returns the computation's failure, [`ComputeError::Cancelled`] if this
    /// context is cancelled first, or [`ComputeError::Internal`] if the
    /// computable produced another type than it declares.
    pub async fn get<C: Computable>(&self, computable: &Arc<C>) -> ComputeResult<Computed<C::Value>> {
        let erased: Arc<dyn AnyComputable> = computable.clone();
        self.get_any(erased).await?.downcast()
    }

    /// Resolve `computable` and return only its value
    ///
    /// # Errors
    ///
    /// As [`Context::get`]
    pub async fn get_value<C: Computable>(&self, computable: &Arc<C>) -> ComputeResult<C::Value> {
        self.get(computable).await.map(|c| c.value)
    }

    /// Resolve a type-erased computable
    ///
    /// # Errors
    ///
    /// As [`Context::get`]
    pub async fn get_any(&self, computable: Arc<dyn AnyComputable>) -> ComputeResult<Computed<AnyValue>> {
        self.start_computing(computable).wait_with(&self.cancel).await
    }

    /// Start resolving `computable` without waiting for it
    #[must_use]
    pub fn start(&self, computable: Arc<dyn AnyComputable>) -> Future<AnyValue> {
        self.start_computing(computable)
    }

    /// Run `work` in the background. It is not cancelled with this context
    /// and the invocation waits for it before returning. A failure of
    /// best-effort work is only logged; other failures fail the invocation.
    pub fn detach<F, Fut>(&self, action: Action, best_effort: bool, work: F)
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let invocation = self.invocation.clone();
        let span = action.span(ActionId::new(), "detach");
        let work = work(self.invocation.detached());

        self.invocation.tasks.spawn(
            async move {
                if let Err(err) = work.await {
                    if best_effort {
                        tracing::warn!(action = %action, error = %format!("{err:#}"), "background work failed");
                    } else {
                        invocation.record_failure(ComputeError::compute(action.name(), err));
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Register `cleanup` to run once the invocation ends, whether or not it
    /// succeeded
    pub fn cleanup<F, Fut>(&self, action: Action, cleanup: F)
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move |ctx| cleanup(ctx).boxed());
        self.invocation
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, boxed));
    }

    /// Run `work` on the invocation's pool and return its result. A failure
    /// is returned to the caller only; it does not fail the invocation.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, or an error if the task panicked
    pub async fn call<T, F, Fut>(&self, work: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let handle = self.invocation.tasks.spawn(work(self.clone()));
        handle.await?
    }

    /// Cache backend
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.invocation.orch.cache
    }

    /// Codec registry
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.invocation.orch.codecs
    }

    /// Orchestrator configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.invocation.orch.config
    }

    /// Cancellation token of this context
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this context was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Same invocation, with `cancel` governing waits
    #[must_use]
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            invocation: self.invocation.clone(),
            cancel,
        }
    }

    /// Same invocation, cancelled together with this context or on its own
    #[must_use]
    pub fn child(&self) -> Self {
        self.with_cancel(self.cancel.child_token())
    }

    fn start_computing(&self, computable: Arc<dyn AnyComputable>) -> Future<AnyValue> {
        match self.prepare(computable) {
            Ok(future) => future,
            Err(err) => Promise::failed(err).future(),
        }
    }

    fn prepare(&self, computable: Arc<dyn AnyComputable>) -> ComputeResult<Future<AnyValue>> {
        if !matches!(computable.scope(), Scope::Precomputed) {
            if let Some(target) = computable.inputs().redirect_target() {
                let _entered = computable.action().span(ActionId::new(), "redirect").entered();
                return Ok(self.start_computing(target));
            }
        }

        let inputs = match computable.scope() {
            Scope::Precomputed => {
                let result = self.compute_precomputed(computable.as_ref());
                return Ok(Promise::resolved(ActionId::new(), result).future());
            }
            _ => ComputedInputs::of(computable.as_ref())?,
        };

        let (promise, start) = match computable.scope() {
            Scope::Instance(state) => {
                let mut start = false;
                let (promise, _) = state.claim(|| {
                    let (promise, fresh) = match &inputs.digest {
                        Some(digest) => self.invocation.shared_promise(digest),
                        None => (Promise::new(ActionId::new()), true),
                    };
                    start = fresh;
                    promise
                });
                (promise, start)
            }
            Scope::Invocation => {
                let digest = inputs.digest.as_ref().ok_or_else(|| {
                    ComputeError::internal(format!(
                        "{}: invocation-scoped computable without a stable digest",
                        computable.type_name()
                    ))
                })?;
                self.invocation.shared_promise(digest)
            }
            Scope::Precomputed => {
                return Err(ComputeError::internal("precomputed scope changed between calls"));
            }
        };

        if !start {
            self.invocation.orch.metrics.record_dedup();
            return Ok(promise.future());
        }

        let ctx = self.invocation.root();
        let task = promise.clone();
        let span = computable.action().span(promise.id(), "compute");
        self.invocation.tasks.spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(ComputeError::Cancelled),
                    result = ctx.wait_compute(computable.as_ref(), inputs) => result,
                };
                task.resolve(result);
            }
            .instrument(span),
        );

        Ok(promise.future())
    }

    /// Compute a precomputed node in place; it must not suspend
    pub(crate) fn compute_precomputed(&self, computable: &dyn AnyComputable) -> ComputeResult<Computed<AnyValue>> {
        let type_name = short_type_name(computable.type_name());
        let resolved = Resolved::default();
        let value = computable
            .compute_any(self, &resolved)
            .now_or_never()
            .ok_or_else(|| ComputeError::internal(format!("{type_name}: precomputed computable suspended")))?
            .map_err(|err| ComputeError::compute(type_name, err))?;

        let digest = match computable.value_digest() {
            Ok(Some(digest)) => Some(digest),
            Ok(None) => self
                .codecs()
                .lookup(computable.value_type())
                .and_then(|codec| codec.compute_digest(&value).ok()),
            Err(err) => {
                tracing::debug!(type_name, error = %format!("{err:#}"), "precomputed value has no digest");
                None
            }
        };

        let mut computed = Computed::new(value, digest);
        computed.non_deterministic = computable.output().non_deterministic;
        Ok(computed)
    }

    pub(crate) fn cache_policy(&self, computable: &dyn AnyComputable) -> CachePolicy {
        let config = &self.invocation.orch.config;
        let codec = self.codecs().lookup(computable.value_type());
        let should_cache = config.caching_enabled
            && computable.output().can_cache()
            && codec.as_ref().is_some_and(|codec| codec.can_store());
        CachePolicy {
            codec,
            should_cache,
            verify: config.verify_caching,
        }
    }

    async fn wait_compute(
        &self,
        computable: &dyn AnyComputable,
        mut inputs: ComputedInputs,
    ) -> ComputeResult<Computed<AnyValue>> {
        let policy = self.cache_policy(computable);
        let mut hits = Vec::new();

        if policy.should_cache {
            if let Some(digest) = inputs.digest.clone() {
                if let Some(hit) = self.load_from_cache(computable, &policy, &digest, "cache.load.pre").await {
                    if !policy.verify {
                        self.invocation.orch.metrics.record_cache_hit();
                        return Ok(hit.computed);
                    }
                    hits.push(hit);
                }
            }
        }

        let resolved = self.wait_deps(&inputs).await?;
        inputs.finalize(resolved.results())?;

        if policy.should_cache {
            if let Some(digest) = inputs.post_compute_digest.clone() {
                if inputs.digest.as_ref() != Some(&digest) {
                    if let Some(hit) = self.load_from_cache(computable, &policy, &digest, "cache.load.post").await {
                        if !policy.verify {
                            self.invocation.orch.metrics.record_cache_hit();
                            return Ok(hit.computed);
                        }
                        hits.push(hit);
                    }
                }
            }
        }

        let computed = self.run_compute(computable, &policy, &inputs, &resolved).await?;

        for hit in hits {
            if computed.digest.as_ref() != Some(&hit.output_digest) {
                tracing::error!(
                    type_name = computable.type_name(),
                    input = %hit.input,
                    expected = %hit.output_digest,
                    got = ?computed.digest.as_ref().map(ToString::to_string),
                    "verify caching: output differs from cached output"
                );
            }
        }

        Ok(computed)
    }

    /// Resolve every declared dependency concurrently
    pub(crate) async fn wait_deps(&self, inputs: &ComputedInputs) -> ComputeResult<Resolved> {
        let pending = inputs.deps().iter().map(|(key, dep)| {
            let key = key.clone();
            let dep = dep.clone();
            async move {
                let type_name = short_type_name(dep.type_name());
                match self.get_any(dep.clone()).await {
                    Ok(computed) => Ok((key, computed)),
                    Err(err) => Err(ComputeError::dependency(key, type_name, err)),
                }
            }
        });

        let results = futures::future::try_join_all(pending).await?;
        Ok(Resolved::new(results.into_iter().collect()))
    }

    /// Look up `pointer` in the cache. Read and decode failures count as a miss.
    pub(crate) async fn load_from_cache(
        &self,
        computable: &dyn AnyComputable,
        policy: &CachePolicy,
        pointer: &Digest,
        phase: &'static str,
    ) -> Option<CacheHit> {
        let codec = policy.codec.as_ref()?;
        let cache = self.cache();
        let span = computable.action().span(ActionId::new(), phase);

        async {
            let entry = match cache.load_entry(pointer).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::debug!(input = %pointer, "not cached");
                    return None;
                }
                Err(err) => {
                    tracing::debug!(input = %pointer, error = %err, "cache index read failed");
                    return None;
                }
            };

            let value = match codec.load_cached(cache, &entry.digest).await {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(output = %entry.digest, error = %format!("{err:#}"), "cached output unreadable");
                    return None;
                }
            };

            if policy.verify {
                match codec.compute_digest(&value) {
                    Ok(digest) if digest == entry.digest => {}
                    Ok(digest) => tracing::error!(
                        expected = %entry.digest,
                        got = %digest,
                        "verify caching: loaded value digests differently"
                    ),
                    Err(err) => tracing::error!(
                        error = %format!("{err:#}"),
                        "verify caching: failed to digest loaded value"
                    ),
                }
            }

            let mut computed = Computed::new(value, Some(entry.digest.clone()));
            computed.cached = true;
            computed.completed = entry.timestamp;
            Some(CacheHit {
                computed,
                output_digest: entry.digest,
                input: pointer.clone(),
            })
        }
        .instrument(span)
        .await
    }

    /// Take a lease, compute, digest the output and schedule the cache write
    pub(crate) async fn run_compute(
        &self,
        computable: &dyn AnyComputable,
        policy: &CachePolicy,
        inputs: &ComputedInputs,
        resolved: &Resolved,
    ) -> ComputeResult<Computed<AnyValue>> {
        let orch = &self.invocation.orch;
        let action = computable.action();
        let type_name = short_type_name(computable.type_name());

        let lease = orch
            .throttle
            .acquire(&action.throttle_labels(), &self.cancel)
            .instrument(action.span(ActionId::new(), "lease.wait"))
            .await?;
        let result = computable.compute_any(self, resolved).await;
        drop(lease);

        orch.metrics.record_compute(result.is_ok());
        let value = result.map_err(|err| ComputeError::compute(type_name, err))?;

        let digest = match &policy.codec {
            Some(codec) => match codec.compute_digest(&value) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    tracing::debug!(type_name, error = %format!("{err:#}"), "output has no digest");
                    None
                }
            },
            None => None,
        };

        let mut computed = Computed::new(value, digest);
        computed.non_deterministic = computable.output().non_deterministic;

        if policy.should_cache {
            if let (Some(codec), Some(digest)) = (&policy.codec, &computed.digest) {
                self.defer_store(
                    &action,
                    codec.clone(),
                    computed.value.clone(),
                    digest.clone(),
                    computed.completed,
                    inputs,
                );
            }
        }

        Ok(computed)
    }

    fn defer_store(
        &self,
        action: &Action,
        codec: Arc<dyn ErasedCodec>,
        value: AnyValue,
        expected: Digest,
        completed: DateTime<Utc>,
        inputs: &ComputedInputs,
    ) {
        let mut pointers: Vec<Digest> = Vec::new();
        for pointer in [&inputs.digest, &inputs.post_compute_digest].into_iter().flatten() {
            if !pointers.contains(pointer) {
                pointers.push(pointer.clone());
            }
        }
        if pointers.is_empty() {
            return;
        }

        let mut output = CachedOutput::new(expected.clone(), completed);
        output.input_digests = inputs.input_digests();
        output.debug = CachedOutputDebug {
            serial: inputs.serial(),
            module_path: inputs.module_path().to_string(),
            type_name: inputs.type_name().to_string(),
        };

        let orch = self.invocation.orch.clone();
        let store = action.renamed(|name| format!("cache.store ({name})"));
        self.detach(store, true, move |_| async move {
            let result = async {
                let digest = codec.cache(&orch.cache, &value).await?;
                if orch.config.verify_caching && digest != expected {
                    tracing::error!(
                        got = %digest,
                        %expected,
                        "verify caching: non-determinism writing to the output cache"
                    );
                }
                output.digest = digest;
                orch.cache.store_entry(&pointers, &output).await?;
                anyhow::Ok(())
            }
            .await;

            orch.metrics.record_store(result.is_ok());
            result
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computable::{InstanceState, Output};
    use crate::inputs::Inputs;
    use async_trait::async_trait;
    use kiln_storage::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Greeting {
        name: String,
        calls: Arc<AtomicUsize>,
        state: InstanceState,
    }

    impl Greeting {
        fn new(name: &str, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: calls.clone(),
                state: InstanceState::new(),
            })
        }
    }

    #[async_trait]
    impl Computable for Greeting {
        type Value = String;

        fn inputs(&self) -> Inputs {
            Inputs::new().str("name", &self.name)
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Instance(&self.state)
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("hello {}", self.name))
        }
    }

    struct Sleeper {
        state: InstanceState,
    }

    #[async_trait]
    impl Computable for Sleeper {
        type Value = String;

        fn inputs(&self) -> Inputs {
            Inputs::new().indigestible("clock", "now")
        }

        fn output(&self) -> Output {
            Output::new().non_deterministic()
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Instance(&self.state)
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    struct Shared;

    #[async_trait]
    impl Computable for Shared {
        type Value = String;

        fn inputs(&self) -> Inputs {
            Inputs::new().indigestible("x", 1)
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Invocation
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn orchestrator() -> (Arc<MemoryCache>, Orchestrator) {
        let memory = Arc::new(MemoryCache::new());
        let orch = Orchestrator::builder(memory.clone())
            .with_codecs(Arc::new(CodecRegistry::with_builtins()))
            .build();
        (memory, orch)
    }

    #[tokio::test]
    async fn test_get_and_store() {
        let (memory, orch) = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let greeting = Greeting::new("kiln", &calls);

        let computed = orch
            .run(|ctx| async move { ctx.get(&greeting).await })
            .await
            .unwrap();
        assert_eq!(computed.value, "hello kiln");
        assert!(computed.digest.is_some());
        assert!(!computed.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The invocation waits for the deferred store.
        assert_eq!(memory.entry_count(), 1);
        assert_eq!(orch.metrics().stores, 1);
    }

    #[tokio::test]
    async fn test_instance_reuse_within_invocation() {
        let (_, orch) = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let greeting = Greeting::new("kiln", &calls);

        orch.run(|ctx| async move {
            let a = ctx.get(&greeting).await?;
            let b = ctx.get(&greeting).await?;
            assert_eq!(a.value, b.value);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.metrics().dedup_hits, 1);
    }

    #[tokio::test]
    async fn test_caching_disabled() {
        let memory = Arc::new(MemoryCache::new());
        let orch = Orchestrator::builder(memory.clone())
            .with_config(OrchestratorConfig::default().with_caching(false))
            .build();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let greeting = Greeting::new("kiln", &calls);
            orch.run(|ctx| async move { ctx.get(&greeting).await })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(memory.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_invocation_scope_requires_digest() {
        let (_, orch) = orchestrator();
        let err = orch
            .run(|ctx| async move { ctx.get(&Arc::new(Shared)).await })
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_cancel_waiter() {
        let (_, orch) = orchestrator();
        let cancel = CancellationToken::new();
        let sleeper = Arc::new(Sleeper {
            state: InstanceState::new(),
        });

        let trigger = cancel.clone();
        let err = orch
            .run_with(cancel, |ctx| async move {
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    trigger.cancel();
                });
                ctx.get(&sleeper).await
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_detach_and_cleanup() {
        let (_, orch) = orchestrator();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        orch.run(|ctx| async move {
            let log = seen.clone();
            ctx.cleanup(Action::new("cleanup"), move |_| async move {
                log.lock().unwrap().push("cleanup");
                Ok(())
            });
            let log = seen.clone();
            ctx.detach(Action::new("background"), false, move |_| async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                log.lock().unwrap().push("detached");
                Ok(())
            });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["detached", "cleanup"]);
    }

    #[tokio::test]
    async fn test_detach_failure_fails_invocation() {
        let (_, orch) = orchestrator();

        let err = orch
            .run(|ctx| async move {
                ctx.detach(Action::new("required"), false, |_| async { anyhow::bail!("disk full") });
                ctx.detach(Action::new("optional"), true, |_| async { anyhow::bail!("ignored") });
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_failure() {
        let (_, orch) = orchestrator();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let err = orch
            .run(|ctx| async move {
                ctx.cleanup(Action::new("first"), {
                    let counter = counter.clone();
                    move |_| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("cleanup failed")
                    }
                });
                ctx.cleanup(Action::new("second"), move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Err::<(), _>(ComputeError::internal("body failed"))
            })
            .await
            .unwrap_err();

        // The body's error wins over the cleanup error.
        assert!(err.to_string().contains("body failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_error_reported_on_success() {
        let (_, orch) = orchestrator();
        let err = orch
            .run(|ctx| async move {
                ctx.cleanup(Action::new("teardown"), |_| async { anyhow::bail!("teardown failed") });
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("teardown failed"));
    }

    #[tokio::test]
    async fn test_call_does_not_fail_invocation() {
        let (_, orch) = orchestrator();
        let result = orch
            .run(|ctx| async move {
                let err = ctx
                    .call(|_| async { Err::<u32, _>(anyhow::anyhow!("probe failed")) })
                    .await
                    .unwrap_err();
                assert!(err.to_string().contains("probe failed"));
                let ok = ctx.call(|_| async { Ok(7u32) }).await.unwrap();
                Ok(ok)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
    }
}
