//! The unit of deferred work.

use crate::action::Action;
use crate::error::{ComputeError, ComputeResult};
use crate::inputs::Inputs;
use crate::orchestrator::Context;
use crate::promise::{AnyValue, Computed, Promise};
use async_trait::async_trait;
use futures::future::BoxFuture;
use kiln_core::Digest;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Output flags of a computable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Output {
    /// The same inputs may yield different outputs
    pub non_deterministic: bool,
    /// Never store or load this output from the cache
    pub not_cacheable: bool,
}

impl Output {
    /// Cacheable, deterministic output
    #[must_use]
    pub const fn new() -> Self {
        Self {
            non_deterministic: false,
            not_cacheable: false,
        }
    }

    /// Mark as not cacheable
    #[must_use]
    pub const fn dont_cache(mut self) -> Self {
        self.not_cacheable = true;
        self
    }

    /// Mark as non-deterministic
    #[must_use]
    pub const fn non_deterministic(mut self) -> Self {
        self.non_deterministic = true;
        self
    }

    /// Whether the output may be stored in and served from the cache
    #[must_use]
    pub const fn can_cache(&self) -> bool {
        !self.not_cacheable && !self.non_deterministic
    }
}

/// Where a computable's execution state lives
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Tied to the owning value; repeated requests on the same instance
    /// share one execution.
    Instance(&'a InstanceState),
    /// Shared across the whole invocation, keyed purely by input digest.
    /// Inputs must be deterministic.
    Invocation,
    /// Wraps a value that is already known; `compute` must not suspend.
    Precomputed,
}

/// Execution state embedded in instance-scoped computables
#[derive(Debug, Default)]
pub struct InstanceState {
    promise: Mutex<Option<Promise<AnyValue>>>,
}

impl InstanceState {
    /// Fresh state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this instance has started (or finished) computing
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.promise
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The instance promise, creating it with `create` if absent. A promise
    /// that ended in cancellation is replaced. Returns `true` when the
    /// caller must start the computation.
    pub(crate) fn claim(
        &self,
        create: impl FnOnce() -> Promise<AnyValue>,
    ) -> (Promise<AnyValue>, bool) {
        let mut slot = self.promise.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            let cancelled = matches!(existing.peek(), Some(Err(ref e)) if e.is_cancelled());
            if !cancelled {
                return (existing.clone(), false);
            }
        }

        let promise = create();
        *slot = Some(promise.clone());
        (promise, true)
    }
}

/// A node in the computation graph.
///
/// Every input that can affect the output must be declared in
/// [`Computable::inputs`]; dependencies declared there are resolved before
/// [`Computable::compute`] runs and are available through [`Resolved`].
#[async_trait]
pub trait Computable: Send + Sync + 'static {
    /// Produced value
    type Value: Clone + Send + Sync + 'static;

    /// Tracing descriptor
    fn action(&self) -> Action {
        Action::new(short_type_name(std::any::type_name::<Self>()))
    }

    /// Declared inputs
    fn inputs(&self) -> Inputs;

    /// Output flags
    fn output(&self) -> Output {
        Output::new()
    }

    /// Lifecycle scope
    fn scope(&self) -> Scope<'_>;

    /// Self-describing digest of a precomputed value
    ///
    /// # Errors
    ///
    /// Returns error if the digest cannot be produced
    fn value_digest(&self) -> anyhow::Result<Option<Digest>> {
        Ok(None)
    }

    /// Produce the value
    async fn compute(&self, ctx: &Context, deps: &Resolved) -> anyhow::Result<Self::Value>;
}

/// Object-safe view of a [`Computable`], implemented for every computable.
pub trait AnyComputable: Send + Sync + 'static {
    /// Tracing descriptor
    fn action(&self) -> Action;
    /// Declared inputs
    fn inputs(&self) -> Inputs;
    /// Output flags
    fn output(&self) -> Output;
    /// Lifecycle scope
    fn scope(&self) -> Scope<'_>;
    /// Full type name of the computable
    fn type_name(&self) -> &'static str;
    /// Type of the produced value
    fn value_type(&self) -> TypeId;
    /// Name of the produced value type
    fn value_type_name(&self) -> &'static str;
    /// Self-describing digest of a precomputed value
    ///
    /// # Errors
    ///
    /// Returns error if the digest cannot be produced
    fn value_digest(&self) -> anyhow::Result<Option<Digest>>;
    /// Produce the value, type-erased
    fn compute_any<'a>(
        &'a self,
        ctx: &'a Context,
        deps: &'a Resolved,
    ) -> BoxFuture<'a, anyhow::Result<AnyValue>>;
}

impl<C: Computable> AnyComputable for C {
    fn action(&self) -> Action {
        Computable::action(self)
    }

    fn inputs(&self) -> Inputs {
        Computable::inputs(self)
    }

    fn output(&self) -> Output {
        Computable::output(self)
    }

    fn scope(&self) -> Scope<'_> {
        Computable::scope(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn value_type(&self) -> TypeId {
        TypeId::of::<C::Value>()
    }

    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<C::Value>()
    }

    fn value_digest(&self) -> anyhow::Result<Option<Digest>> {
        Computable::value_digest(self)
    }

    fn compute_any<'a>(
        &'a self,
        ctx: &'a Context,
        deps: &'a Resolved,
    ) -> BoxFuture<'a, anyhow::Result<AnyValue>> {
        Box::pin(async move {
            let value = Computable::compute(self, ctx, deps).await?;
            Ok(Arc::new(value) as AnyValue)
        })
    }
}

/// Split a type name into its module path and the type itself.
///
/// Generic arguments stay with the type.
pub(crate) fn split_type_name(full: &str) -> (&str, &str) {
    let generics = full.find('<').unwrap_or(full.len());
    match full[..generics].rfind("::") {
        Some(index) => (&full[..index], &full[index + 2..]),
        None => ("", full),
    }
}

/// Type name without its module path
#[must_use]
pub fn short_type_name(full: &str) -> &str {
    split_type_name(full).1
}

/// Resolved dependency values, keyed by input name
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    results: Arc<HashMap<String, Computed<AnyValue>>>,
}

impl Resolved {
    pub(crate) fn new(results: HashMap<String, Computed<AnyValue>>) -> Self {
        Self {
            results: Arc::new(results),
        }
    }

    pub(crate) fn results(&self) -> &HashMap<String, Computed<AnyValue>> {
        &self.results
    }

    /// Result of the dependency declared as `key`
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Internal`] if there is no such dependency or it
    /// produced another type
    pub fn get<V: Any + Clone + Send + Sync>(&self, key: &str) -> ComputeResult<Computed<V>> {
        self.results
            .get(key)
            .cloned()
            .ok_or_else(|| ComputeError::internal(format!("no resolved dependency named {:?}", key)))?
            .downcast()
    }

    /// Value of the dependency declared as `key`
    ///
    /// # Errors
    ///
    /// As [`Resolved::get`]
    pub fn value<V: Any + Clone + Send + Sync>(&self, key: &str) -> ComputeResult<V> {
        self.get(key).map(|c| c.value)
    }

    /// Output digest of the dependency declared as `key`
    #[must_use]
    pub fn digest(&self, key: &str) -> Option<&Digest> {
        self.results.get(key).and_then(|c| c.digest.as_ref())
    }

    /// Names of the resolved dependencies
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    /// Number of resolved dependencies
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if nothing was resolved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
