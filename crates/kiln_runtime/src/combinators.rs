//! Ready-made computables.
//!
//! Most graphs are built from a handful of shapes: a function of some
//! declared inputs ([`map`]), a one-off step that should never be shared
//! ([`inline`]), a derivation of another node's value ([`transform`]), a
//! relabelled node ([`named`], [`sticky`]) and values that are already known
//! ([`precomputed`], [`error`]).

use crate::action::Action;
use crate::computable::{Computable, InstanceState, Output, Resolved, Scope, short_type_name};
use crate::error::ComputeError;
use crate::inputs::Inputs;
use crate::orchestrator::Context;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::Digest;
use std::future::Future;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::Arc;

type ComputeFn<T> = Arc<dyn Fn(Context, Resolved) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

type DigestFn<T> = Arc<dyn Fn(&T) -> anyhow::Result<Digest> + Send + Sync>;

/// A function of declared inputs; see [`map`]
pub struct Map<T> {
    action: Action,
    inputs: Inputs,
    output: Output,
    state: InstanceState,
    compute: ComputeFn<T>,
}

/// Computable that runs `f` once `inputs` are resolved.
///
/// Two maps with equal inputs share a digest, and therefore a result, within
/// an invocation and across the cache. Declare whatever tells them apart.
pub fn map<T, F, Fut>(action: Action, inputs: Inputs, output: Output, f: F) -> Arc<Map<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Context, Resolved) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(Map {
        action,
        inputs,
        output,
        state: InstanceState::new(),
        compute: Arc::new(move |ctx: Context, deps: Resolved| f(ctx, deps).boxed()),
    })
}

/// Computable that runs `f` without being shared or cached
pub fn inline<T, F, Fut>(action: Action, f: F) -> Arc<Map<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let inputs = Inputs::new().indigestible("inline", action.name());
    map(action, inputs, Output::new().dont_cache(), move |ctx, _| f(ctx))
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Computable for Map<T> {
    type Value = T;

    fn action(&self) -> Action {
        self.action.clone()
    }

    fn inputs(&self) -> Inputs {
        self.inputs.clone()
    }

    fn output(&self) -> Output {
        self.output
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Instance(&self.state)
    }

    async fn compute(&self, ctx: &Context, deps: &Resolved) -> anyhow::Result<T> {
        (self.compute)(ctx.clone(), deps.clone()).await
    }
}

/// Another node's value passed through a function; see [`transform`]
pub struct Transform<C: Computable, T> {
    action: Action,
    desc: String,
    from: Arc<C>,
    state: InstanceState,
    apply: Arc<dyn Fn(Context, C::Value) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>,
}

/// Computable deriving a value from `from`. The closure cannot be digested,
/// so the node is neither shared nor cached; `from` still is.
pub fn transform<C, T, F, Fut>(desc: impl Into<String>, from: Arc<C>, f: F) -> Arc<Transform<C, T>>
where
    C: Computable,
    T: Clone + Send + Sync + 'static,
    F: Fn(Context, C::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let desc = desc.into();
    let action = Computable::action(from.as_ref()).renamed(|name| format!("{name}: {desc}"));
    Arc::new(Transform {
        action,
        desc,
        from,
        state: InstanceState::new(),
        apply: Arc::new(move |ctx: Context, value: C::Value| f(ctx, value).boxed()),
    })
}

#[async_trait]
impl<C: Computable, T: Clone + Send + Sync + 'static> Computable for Transform<C, T> {
    type Value = T;

    fn action(&self) -> Action {
        self.action.clone()
    }

    fn inputs(&self) -> Inputs {
        Inputs::new()
            .computable("from", self.from.clone())
            .indigestible("transform", &self.desc)
    }

    fn output(&self) -> Output {
        Output::new().dont_cache()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Instance(&self.state)
    }

    async fn compute(&self, ctx: &Context, deps: &Resolved) -> anyhow::Result<T> {
        let value = deps.value::<C::Value>("from")?;
        (self.apply)(ctx.clone(), value).await
    }
}

/// A node under another name; see [`named`]
pub struct Named<C> {
    action: Action,
    inner: Arc<C>,
    sticky: bool,
    state: InstanceState,
}

/// Relabel `inner` for tracing. The wrapper itself is never cached; `inner`
/// still is.
pub fn named<C: Computable>(action: Action, inner: Arc<C>) -> Arc<Named<C>> {
    Arc::new(Named {
        action,
        inner,
        sticky: false,
        state: InstanceState::new(),
    })
}

/// Like [`named`], but the wrapper takes on the identity of `inner`:
/// resolving it joins `inner`'s promise instead of running a node of its
/// own, so every caller, wrapped or not, sees the same result.
pub fn sticky<C: Computable>(action: Action, inner: Arc<C>) -> Arc<Named<C>> {
    Arc::new(Named {
        action,
        inner,
        sticky: true,
        state: InstanceState::new(),
    })
}

#[async_trait]
impl<C: Computable> Computable for Named<C> {
    type Value = C::Value;

    fn action(&self) -> Action {
        self.action.clone()
    }

    fn inputs(&self) -> Inputs {
        let inputs = Inputs::new()
            .computable("inner", self.inner.clone())
            .str("name", self.action.name());
        if self.sticky {
            return inputs.redirect_to(self.inner.clone());
        }
        inputs
    }

    fn output(&self) -> Output {
        Computable::output(self.inner.as_ref()).dont_cache()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Instance(&self.state)
    }

    async fn compute(&self, _ctx: &Context, deps: &Resolved) -> anyhow::Result<C::Value> {
        Ok(deps.value::<C::Value>("inner")?)
    }
}

/// A value that is already known; see [`precomputed`]
pub struct Precomputed<T> {
    value: T,
    digest: Option<DigestFn<T>>,
}

/// Computable wrapping `value`. With `digest`, the value is identified by
/// what it returns; without it the node is non-deterministic.
pub fn precomputed<T, D>(value: T, digest: Option<D>) -> Arc<Precomputed<T>>
where
    T: Clone + Send + Sync + 'static,
    D: Fn(&T) -> anyhow::Result<Digest> + Send + Sync + 'static,
{
    Arc::new(Precomputed {
        value,
        digest: digest.map(|d| Arc::new(d) as DigestFn<T>),
    })
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Computable for Precomputed<T> {
    type Value = T;

    fn action(&self) -> Action {
        Action::new(format!("precomputed {}", short_type_name(std::any::type_name::<T>())))
    }

    fn inputs(&self) -> Inputs {
        let Some(digest) = &self.digest else {
            return Inputs::new().indigestible("value", std::any::type_name::<T>());
        };

        let digest = digest.clone();
        let value = self.value.clone();
        Inputs::new().marshal("digest", move |w| {
            let digest = digest(&value)?;
            w.write_all(digest.to_string().as_bytes())?;
            Ok(())
        })
    }

    fn output(&self) -> Output {
        Output::new().dont_cache()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Precomputed
    }

    fn value_digest(&self) -> anyhow::Result<Option<Digest>> {
        self.digest.as_ref().map(|digest| digest(&self.value)).transpose()
    }

    async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<T> {
        Ok(self.value.clone())
    }
}

/// A failure that is already known; see [`error`]
pub struct Failed<T> {
    err: ComputeError,
    _value: PhantomData<fn() -> T>,
}

/// Computable that fails with `err`
#[must_use]
pub fn error<T: Clone + Send + Sync + 'static>(err: ComputeError) -> Arc<Failed<T>> {
    Arc::new(Failed {
        err,
        _value: PhantomData,
    })
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Computable for Failed<T> {
    type Value = T;

    fn action(&self) -> Action {
        Action::new("error")
    }

    fn inputs(&self) -> Inputs {
        Inputs::new().indigestible("error", self.err.to_string())
    }

    fn output(&self) -> Output {
        Output::new().dont_cache()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Precomputed
    }

    async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<T> {
        Err(self.err.clone().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::inputs::ComputedInputs;
    use crate::orchestrator::Orchestrator;
    use kiln_storage::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orchestrator() -> (Arc<MemoryCache>, Orchestrator) {
        let cache = Arc::new(MemoryCache::new());
        let orch = Orchestrator::builder(cache.clone())
            .with_codecs(Arc::new(CodecRegistry::with_builtins()))
            .build();
        (cache, orch)
    }

    fn sum(name: &str, a: i64, b: i64) -> Arc<Map<String>> {
        let lhs = precomputed(a.to_string(), Some(|v: &String| Ok(Digest::of_bytes(v.as_bytes()))));
        let rhs = precomputed(b.to_string(), Some(|v: &String| Ok(Digest::of_bytes(v.as_bytes()))));
        map(
            Action::new(name),
            Inputs::new().str("op", "sum").computable("a", lhs).computable("b", rhs),
            Output::new(),
            |_, deps| async move {
                let a: i64 = deps.value::<String>("a")?.parse()?;
                let b: i64 = deps.value::<String>("b")?.parse()?;
                Ok((a + b).to_string())
            },
        )
    }

    #[tokio::test]
    async fn test_map_over_precomputed() {
        let (cache, orch) = orchestrator();
        let node = sum("sum", 2, 3);

        // Precomputed leaves are identified by their values once resolved.
        let inputs = ComputedInputs::of(node.as_ref()).unwrap();
        assert!(!inputs.is_non_deterministic());

        let result = orch.run(|ctx| async move { ctx.get(&node).await }).await.unwrap();
        assert_eq!(result.value, "5");
        assert!(!result.cached);
        assert_eq!(cache.entry_count(), 1);

        let again = sum("sum again", 2, 3);
        let result = orch.run(|ctx| async move { ctx.get(&again).await }).await.unwrap();
        assert!(result.cached);
    }

    #[tokio::test]
    async fn test_inline_runs_every_time() {
        let (cache, orch) = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let stamp = || {
            let counted = calls.clone();
            inline(Action::new("stamp"), move |_| {
                let calls = counted.clone();
                async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
            })
        };

        assert!(ComputedInputs::of(stamp().as_ref()).unwrap().is_non_deterministic());
        for _ in 0..2 {
            let node = stamp();
            orch.run(|ctx| async move { ctx.get(&node).await }).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_transform_renames_and_skips_cache() {
        let (cache, orch) = orchestrator();
        let source = sum("source", 1, 1);
        let node = transform("shout", source, |_, value: String| async move { Ok(format!("{value}!")) });
        assert_eq!(Computable::action(node.as_ref()).name(), "source: shout");

        let result = orch.run(|ctx| async move { ctx.get(&node).await }).await.unwrap();
        assert_eq!(result.value, "2!");
        // Only the source was stored.
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_transforms_with_one_description_stay_apart() {
        let (_, orch) = orchestrator();
        let source = sum("source", 2, 3);
        let wrapped = transform("fmt", source.clone(), |_, value: String| async move { Ok(format!("<{value}>")) });
        let length = transform("fmt", source, |_, value: String| async move { Ok(value.len().to_string()) });
        assert!(ComputedInputs::of(length.as_ref()).unwrap().is_non_deterministic());

        let (wrapped, length) = orch
            .run(|ctx| async move { Ok((ctx.get_value(&wrapped).await?, ctx.get_value(&length).await?)) })
            .await
            .unwrap();
        assert_eq!(wrapped, "<5>");
        assert_eq!(length, "1");
    }

    fn counted(calls: &Arc<AtomicUsize>) -> Arc<Map<String>> {
        let calls = calls.clone();
        map(
            Action::new("counted"),
            Inputs::new().str("what", "counted"),
            Output::new(),
            move |_, _| {
                let calls = calls.clone();
                async move { Ok(format!("run {}", calls.fetch_add(1, Ordering::SeqCst))) }
            },
        )
    }

    #[tokio::test]
    async fn test_sticky_takes_inner_identity() {
        let (_, orch) = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = counted(&calls);
        orch.run(|ctx| async move { ctx.get(&inner).await }).await.unwrap();

        // A relabelled wrapper is a node of its own and never comes from the cache.
        let plain = named(Action::new("plain"), counted(&calls));
        let plain = orch.run(|ctx| async move { ctx.get(&plain).await }).await.unwrap();
        assert!(!plain.cached);
        assert_eq!(plain.value, "run 0");

        // A sticky one resolves to exactly what the inner node resolves to.
        let inner = counted(&calls);
        let wrapper = sticky(Action::new("sticky"), inner.clone());
        let (wrapped, direct) = orch
            .run(|ctx| async move { Ok((ctx.get(&wrapper).await?, ctx.get(&inner).await?)) })
            .await
            .unwrap();
        assert!(wrapped.cached);
        assert_eq!(wrapped.value, "run 0");
        assert_eq!(wrapped.digest, direct.digest);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.metrics().dedup_hits, 1);
    }

    #[tokio::test]
    async fn test_named_passes_value_through() {
        let (_, orch) = orchestrator();
        let node = named(Action::new("answer"), sum("inner", 40, 2));
        assert!(!Computable::output(node.as_ref()).can_cache());

        let value = orch.run(|ctx| async move { ctx.get_value(&node).await }).await.unwrap();
        assert_eq!(value, "42");
    }

    #[tokio::test]
    async fn test_precomputed_digest() {
        let (_, orch) = orchestrator();
        let known = precomputed(vec![1u8, 2, 3], None::<fn(&Vec<u8>) -> anyhow::Result<Digest>>);
        let result = orch.run(|ctx| async move { ctx.get(&known).await }).await.unwrap();
        // Falls back to the registered codec.
        assert_eq!(result.digest, Some(Digest::of_bytes(&[1, 2, 3])));

        let unknown = precomputed(7u32, None::<fn(&u32) -> anyhow::Result<Digest>>);
        assert!(ComputedInputs::of(unknown.as_ref()).unwrap().is_non_deterministic());
        let result = orch.run(|ctx| async move { ctx.get(&unknown).await }).await.unwrap();
        assert_eq!(result.value, 7);
        assert_eq!(result.digest, None);
    }

    #[tokio::test]
    async fn test_error_fails_dependents() {
        let (_, orch) = orchestrator();
        let failing = error::<String>(ComputeError::internal("no such file"));
        let node = transform("len", failing, |_, value: String| async move { Ok(value.len()) });

        let err = orch
            .run(|ctx| async move { ctx.get(&node).await })
            .await
            .unwrap_err();
        assert_eq!(err.failed_dependency(), Some("from"));
        assert!(err.to_string().contains("no such file"));
    }
}
