//! Continuous recomputation.
//!
//! [`continuously`] resolves a [`Sinkable`]'s dependencies and calls
//! [`Sinkable::updated`] every time the resolved set changes. Each dependency
//! is tracked by an observable that recomputes it when its own dependencies
//! change, and that follows [`Versioned`](crate::codec::Versioned) values as
//! they publish new versions.
//!
//! Updates that arrive while `updated` runs are batched per key and
//! dispatched together once it returns; calls never overlap.

use crate::computable::{AnyComputable, Resolved, Scope, short_type_name};
use crate::codec::VersionSender;
use crate::error::{ComputeError, ComputeResult};
use crate::inputs::{ComputedInputs, Inputs};
use crate::orchestrator::Context;
use crate::promise::{AnyValue, Computed};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::Digest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Whether a sink keeps running after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep watching for changes
    Continue,
    /// End the loop cleanly
    Stop,
}

/// Consumer of continuously recomputed inputs
#[async_trait]
pub trait Sinkable: Send + Sync + 'static {
    /// Inputs to watch
    fn inputs(&self) -> Inputs;

    /// Called with a full set of resolved dependencies whenever it changes
    ///
    /// # Errors
    ///
    /// A returned error ends the loop with that error
    async fn updated(&self, ctx: &SinkContext, resolved: &Resolved) -> ComputeResult<Flow>;

    /// Called once the loop ends, however it ends
    ///
    /// # Errors
    ///
    /// Failures are logged and otherwise ignored
    async fn cleanup(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Maps a recomputation failure to the error that should end the loop;
/// `None` swallows it.
pub type TransformErr = Arc<dyn Fn(ComputeError) -> Option<ComputeError> + Send + Sync>;

type Updated = Arc<dyn Fn(Resolved) -> BoxFuture<'static, ComputeResult<Flow>> + Send + Sync>;
type Rebuilt = Arc<dyn Fn(&str, Computed<AnyValue>) -> bool + Send + Sync>;

enum Halt {
    Done,
    Failed(ComputeError),
}

struct SinkInvocation {
    ctx: Context,
    tasks: TaskTracker,
    halt: Mutex<Option<Halt>>,
    shared: Mutex<HashMap<Digest, Arc<Observable>>>,
    observables: Mutex<Vec<Arc<Observable>>>,
    transform_err: TransformErr,
}

/// Handle given to [`Sinkable::updated`]
#[derive(Clone)]
pub struct SinkContext {
    invocation: Arc<SinkInvocation>,
}

impl std::fmt::Debug for SinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkContext").finish_non_exhaustive()
    }
}

impl SinkContext {
    /// Invocation context the loop runs under
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.invocation.ctx
    }

    /// End the loop with `err`
    pub fn stop(&self, err: ComputeError) {
        self.invocation.halt(Halt::Failed(err));
    }

    /// End the loop cleanly
    pub fn finish(&self) {
        self.invocation.halt(Halt::Done);
    }

    /// Run `work` until it completes, the loop ends, or the returned token is
    /// cancelled. A failure ends the loop.
    pub fn spawn_cancelable<F, Fut>(&self, work: F) -> CancellationToken
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = ComputeResult<()>> + Send + 'static,
    {
        let token = self.invocation.ctx.cancel_token().child_token();
        let work = work(self.invocation.ctx.with_cancel(token.clone()));
        let invocation = self.invocation.clone();
        let cancelled = token.clone();

        self.invocation.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                result = work => {
                    if let Err(err) = result {
                        invocation.halt(Halt::Failed(err));
                    }
                }
            }
        });
        token
    }
}

/// Watch `sinkable`'s inputs and call [`Sinkable::updated`] on every change
/// until it returns [`Flow::Stop`], an error ends the loop, or `ctx` is
/// cancelled.
///
/// # Errors
///
/// Returns the error that ended the loop, after `transform_err` had the
/// chance to swallow recomputation failures, or [`ComputeError::Cancelled`]
pub async fn continuously<S: Sinkable>(
    ctx: &Context,
    sinkable: Arc<S>,
    transform_err: Option<TransformErr>,
) -> ComputeResult<()> {
    let cancel = ctx.cancel_token().child_token();
    let invocation = Arc::new(SinkInvocation {
        ctx: ctx.with_cancel(cancel.clone()),
        tasks: TaskTracker::new(),
        halt: Mutex::new(None),
        shared: Mutex::new(HashMap::new()),
        observables: Mutex::new(Vec::new()),
        transform_err: match transform_err {
            Some(transform_err) => transform_err,
            None => Arc::new(Some),
        },
    });

    let sink_ctx = SinkContext {
        invocation: invocation.clone(),
    };
    let updated: Updated = {
        let sinkable = sinkable.clone();
        Arc::new(move |resolved: Resolved| {
            let sinkable = sinkable.clone();
            let sink_ctx = sink_ctx.clone();
            async move { sinkable.updated(&sink_ctx, &resolved).await }.boxed()
        })
    };

    invocation.sink(sinkable.inputs(), updated);

    invocation.tasks.close();
    tokio::select! {
        _ = invocation.tasks.wait() => {}
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
    invocation.tasks.wait().await;
    invocation.teardown();

    if let Err(err) = sinkable.cleanup(ctx).await {
        tracing::warn!(error = %format!("{err:#}"), "sink cleanup failed");
    }

    let halt = invocation
        .halt
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match halt {
        Some(Halt::Done) => Ok(()),
        Some(Halt::Failed(err)) => Err(err),
        None if ctx.is_cancelled() => Err(ComputeError::Cancelled),
        None => Ok(()),
    }
}

impl SinkInvocation {
    fn cancel(&self) -> &CancellationToken {
        self.ctx.cancel_token()
    }

    fn halt(&self, halt: Halt) {
        {
            let mut slot = self.halt.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(halt);
            }
        }
        self.cancel().cancel();
    }

    /// Run `work` on the loop's pool; [`Flow::Stop`] or an error ends the loop
    fn spawn(self: &Arc<Self>, work: impl std::future::Future<Output = ComputeResult<Flow>> + Send + 'static) {
        let invocation = self.clone();
        self.tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = invocation.cancel().cancelled() => return,
                result = work => result,
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => invocation.halt(Halt::Done),
                Err(err) => invocation.halt(Halt::Failed(err)),
            }
        });
    }

    fn sink(self: &Arc<Self>, inputs: Inputs, updated: Updated) {
        let deps = inputs.computables();
        if deps.is_empty() {
            self.spawn(async move { updated(Resolved::default()).await.map(|_| Flow::Continue) });
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let rebuilt: Rebuilt = Arc::new(move |key: &str, computed: Computed<AnyValue>| tx.send((key.to_string(), computed)).is_ok());

        let mut required = Vec::with_capacity(deps.len());
        for (key, dep) in deps {
            required.push(key.clone());
            if matches!(dep.scope(), Scope::Invocation) {
                self.ensure_shared(dep, key, rebuilt.clone());
            } else {
                let observable = self.observable(dep);
                observable.add_listener(key, rebuilt.clone());
                self.spawn(observable.run());
            }
        }

        let invocation = self.clone();
        self.spawn(invocation.dispatch(required, rx, updated));
    }

    async fn dispatch(
        self: Arc<Self>,
        required: Vec<String>,
        mut updates: mpsc::UnboundedReceiver<(String, Computed<AnyValue>)>,
        updated: Updated,
    ) -> ComputeResult<Flow> {
        let mut last: HashMap<String, Computed<AnyValue>> = HashMap::new();
        let mut pending: Option<HashMap<String, Computed<AnyValue>>> = None;
        let mut in_flight: Option<oneshot::Receiver<Flow>> = None;

        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some((key, result)) = update else {
                        return Ok(Flow::Continue);
                    };

                    if pending.is_none() {
                        let unchanged = last
                            .get(&key)
                            .is_some_and(|previous| previous.digest.is_some() && previous.digest == result.digest);
                        if unchanged {
                            continue;
                        }
                        // The next batch starts from what was last dispatched.
                        pending = Some(last.clone());
                    }
                    let Some(batch) = pending.as_mut() else {
                        continue;
                    };

                    let replace = match batch.get(&key) {
                        None => true,
                        Some(previous) => {
                            result.revision > previous.revision
                                || (previous.digest.is_some() && previous.digest != result.digest)
                        }
                    };
                    if replace {
                        batch.insert(key, result);
                    }
                }
                flow = finished(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    if flow == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
            }

            if in_flight.is_some() {
                continue;
            }
            let ready = pending
                .as_ref()
                .is_some_and(|batch| required.iter().all(|key| batch.contains_key(key)));
            if !ready {
                continue;
            }

            let Some(batch) = pending.take() else {
                continue;
            };
            last = batch.clone();

            let (done, finished_rx) = oneshot::channel();
            in_flight = Some(finished_rx);
            let updated = updated.clone();
            self.spawn(async move {
                let flow = updated(Resolved::new(batch)).await?;
                let _ = done.send(flow);
                Ok(Flow::Continue)
            });
        }
    }

    fn observable(self: &Arc<Self>, computable: Arc<dyn AnyComputable>) -> Arc<Observable> {
        let observable = Arc::new(Observable {
            invocation: self.clone(),
            computable,
            state: Mutex::new(ObservableState::default()),
        });
        self.observables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observable.clone());
        observable
    }

    /// Attach `key` to the observable shared by every invocation-scoped
    /// dependency with the same input digest.
    fn ensure_shared(self: &Arc<Self>, computable: Arc<dyn AnyComputable>, key: String, rebuilt: Rebuilt) {
        let invocation = self.clone();
        self.spawn(async move {
            let inputs = ComputedInputs::of(computable.as_ref())?;
            let digest = inputs.digest.ok_or_else(|| {
                ComputeError::internal(format!(
                    "{}: invocation-scoped computable without a stable digest",
                    computable.type_name()
                ))
            })?;

            let (observable, fresh) = {
                let mut shared = invocation.shared.lock().unwrap_or_else(PoisonError::into_inner);
                match shared.get(&digest) {
                    Some(existing) => (existing.clone(), false),
                    None => {
                        let observable = invocation.observable(computable);
                        shared.insert(digest, observable.clone());
                        (observable, true)
                    }
                }
            };
            if fresh {
                invocation.spawn(observable.clone().run());
            }

            if let Some(latest) = observable.add_listener(key.clone(), rebuilt.clone()) {
                rebuilt(&key, latest);
            }
            Ok(Flow::Continue)
        });
    }

    fn teardown(&self) {
        let observables: Vec<_> = self
            .observables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).clear();

        for observable in observables {
            let mut state = observable.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.clear();
            if let Some(token) = state.version_cancel.take() {
                token.cancel();
            }
        }
    }
}

async fn finished(in_flight: &mut Option<oneshot::Receiver<Flow>>) -> Flow {
    match in_flight {
        Some(rx) => rx.await.unwrap_or(Flow::Continue),
        None => std::future::pending().await,
    }
}

struct Listener {
    id: u64,
    handle: Arc<dyn Fn(Computed<AnyValue>) -> bool + Send + Sync>,
}

#[derive(Default)]
struct ObservableState {
    listeners: Vec<Listener>,
    next_listener: u64,
    revision: u64,
    latest: Option<Computed<AnyValue>>,
    version_cancel: Option<CancellationToken>,
}

/// One dependency under continuous observation
struct Observable {
    invocation: Arc<SinkInvocation>,
    computable: Arc<dyn AnyComputable>,
    state: Mutex<ObservableState>,
}

impl Observable {
    /// Register a listener; returns the latest value if one was published
    fn add_listener(&self, key: String, rebuilt: Rebuilt) -> Option<Computed<AnyValue>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push(Listener {
            id,
            handle: Arc::new(move |computed: Computed<AnyValue>| rebuilt(&key, computed)),
        });

        state.latest.clone().filter(|latest| latest.revision > 0)
    }

    async fn run(self: Arc<Self>) -> ComputeResult<Flow> {
        let ctx = &self.invocation.ctx;
        let computable = self.computable.as_ref();

        let mut deps = Inputs::new();
        let mut dep_count = 0usize;
        if !matches!(computable.scope(), Scope::Precomputed) {
            let inputs = ComputedInputs::of(computable)?;

            let policy = ctx.cache_policy(computable);
            if policy.should_cache() && !policy.verify() {
                if let Some(digest) = &inputs.digest {
                    if let Some(hit) = ctx.load_from_cache(computable, &policy, digest, "cache.load.pre").await {
                        self.new_value(hit.computed);
                    }
                }
            }

            for (key, dep) in inputs.deps() {
                deps = deps.any_computable(key.clone(), dep.clone());
                dep_count += 1;
            }
        }

        let observable = self.clone();
        let updated: Updated = Arc::new(move |resolved: Resolved| {
            let observable = observable.clone();
            async move { observable.updated(resolved, dep_count).await }.boxed()
        });
        self.invocation.sink(deps, updated);
        Ok(Flow::Continue)
    }

    async fn updated(self: Arc<Self>, resolved: Resolved, dep_count: usize) -> ComputeResult<Flow> {
        let ctx = &self.invocation.ctx;
        let computable = self.computable.as_ref();

        if matches!(computable.scope(), Scope::Precomputed) {
            let computed = ctx.compute_precomputed(computable)?;
            self.new_value(computed);
            return Ok(Flow::Continue);
        }

        let policy = ctx.cache_policy(computable);
        let mut inputs = ComputedInputs::of(computable)?;
        inputs.finalize(resolved.results())?;

        let mut hit = None;
        if policy.should_cache() && !policy.verify() {
            if let Some(digest) = inputs.post_compute_digest.clone() {
                hit = ctx.load_from_cache(computable, &policy, &digest, "cache.load.post").await;
            }
        }

        match hit {
            Some(hit) => self.new_value(hit.computed),
            None => match ctx.run_compute(computable, &policy, &inputs, &resolved).await {
                Ok(computed) => self.new_value(computed),
                Err(err) => {
                    tracing::debug!(
                        type_name = short_type_name(computable.type_name()),
                        error = %err,
                        "recomputation failed"
                    );
                    if let Some(err) = (self.invocation.transform_err)(err) {
                        return Err(err);
                    }
                }
            },
        }

        // Nothing upstream can change anymore.
        Ok(if dep_count == 0 { Flow::Stop } else { Flow::Continue })
    }

    fn new_value(self: &Arc<Self>, computed: Computed<AnyValue>) {
        let value = computed.value.clone();
        let digest = computed.digest.clone();

        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.version_cancel.take()
        };
        if let Some(token) = previous {
            token.cancel();
        }

        self.publish(computed, false);

        let codecs = self.invocation.ctx.codecs();
        let Some(versioned) = codecs.versioned(&value) else {
            return;
        };

        let weak = Arc::downgrade(self);
        let versions = VersionSender::new(move |computed, last| {
            if let Some(observable) = weak.upgrade() {
                observable.publish(computed, last);
            }
        });

        match versioned.observe(versions) {
            Ok(token) => {
                let replaced = self
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .version_cancel
                    .replace(token);
                if let Some(token) = replaced {
                    token.cancel();
                }
            }
            Err(err) => tracing::warn!(
                digest = ?digest.as_ref().map(ToString::to_string),
                error = %format!("{err:#}"),
                "failed to observe changes to value"
            ),
        }
    }

    /// Bump the revision, remember `computed` and hand it to every listener.
    /// Listeners that decline are dropped; with none left, version tracking
    /// stops.
    fn publish(&self, mut computed: Computed<AnyValue>, last: bool) {
        let listeners: Vec<_> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.revision += 1;
            computed.revision = state.revision;
            state.latest = Some(computed.clone());
            if last {
                state.version_cancel = None;
            }
            state
                .listeners
                .iter()
                .map(|l| (l.id, l.handle.clone()))
                .collect()
        };

        let declined: Vec<u64> = listeners
            .into_iter()
            .filter(|(_, handle)| !handle(computed.clone()))
            .map(|(id, _)| id)
            .collect();
        if declined.is_empty() {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.retain(|l| !declined.contains(&l.id));
        if state.listeners.is_empty() {
            if let Some(token) = state.version_cancel.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computable::{Computable, InstanceState};
    use crate::codec::CodecRegistry;
    use crate::orchestrator::Orchestrator;
    use kiln_storage::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Computable for Counter {
        type Value = String;

        fn inputs(&self) -> Inputs {
            Inputs::new().str("name", "counter")
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Invocation
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("counted".to_string())
        }
    }

    struct Failing {
        state: InstanceState,
    }

    #[async_trait]
    impl Computable for Failing {
        type Value = String;

        fn inputs(&self) -> Inputs {
            Inputs::new().str("name", "failing")
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Instance(&self.state)
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
            anyhow::bail!("upstream broke")
        }
    }

    struct Both {
        a: Arc<dyn AnyComputable>,
        b: Arc<dyn AnyComputable>,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl Sinkable for Both {
        fn inputs(&self) -> Inputs {
            Inputs::new()
                .any_computable("a", self.a.clone())
                .any_computable("b", self.b.clone())
        }

        async fn updated(&self, _ctx: &SinkContext, resolved: &Resolved) -> ComputeResult<Flow> {
            let mut keys: Vec<String> = resolved.keys().map(str::to_string).collect();
            keys.sort();
            self.seen.lock().unwrap().push(keys);
            Ok(Flow::Stop)
        }
    }

    struct Nothing {
        cleaned: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sinkable for Nothing {
        fn inputs(&self) -> Inputs {
            Inputs::new().str("static", "value")
        }

        async fn updated(&self, _ctx: &SinkContext, resolved: &Resolved) -> ComputeResult<Flow> {
            assert!(resolved.is_empty());
            Ok(Flow::Continue)
        }

        async fn cleanup(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::builder(Arc::new(MemoryCache::new()))
            .with_codecs(Arc::new(CodecRegistry::with_builtins()))
            .build()
    }

    #[tokio::test]
    async fn test_shared_observable_computes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Both {
            a: Arc::new(Counter { calls: calls.clone() }),
            b: Arc::new(Counter { calls: calls.clone() }),
            seen: seen.clone(),
        });

        orchestrator()
            .run(|ctx| async move { continuously(&ctx, sink, None).await })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[tokio::test]
    async fn test_no_dependencies_calls_once() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Nothing {
            cleaned: cleaned.clone(),
        });

        orchestrator()
            .run(|ctx| async move { continuously(&ctx, sink, None).await })
            .await
            .unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_ends_loop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Both {
            a: Arc::new(Failing {
                state: InstanceState::new(),
            }),
            b: Arc::new(Counter {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            seen: seen.clone(),
        });

        let err = orchestrator()
            .run(|ctx| async move { continuously(&ctx, sink, None).await })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upstream broke"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transform_err_swallows_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Both {
            a: Arc::new(Failing {
                state: InstanceState::new(),
            }),
            b: Arc::new(Counter {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            seen: seen.clone(),
        });
        let swallow: TransformErr = Arc::new(|_| None);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let err = orchestrator()
            .run_with(cancel, |ctx| async move {
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    stopper.cancel();
                });
                continuously(&ctx, sink, Some(swallow)).await
            })
            .await
            .unwrap_err();

        // The loop kept running until cancelled; "a" never produced a value.
        assert!(err.is_cancelled());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[derive(Clone)]
    struct Live {
        versions: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    }

    impl crate::codec::Digestible for Live {
        fn compute_digest(&self) -> anyhow::Result<Digest> {
            Ok(Digest::of_bytes(b"initial"))
        }
    }

    impl crate::codec::Versioned for Live {
        fn observe(&self, versions: VersionSender) -> anyhow::Result<CancellationToken> {
            let mut rx = self
                .versions
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow::anyhow!("already observed"))?;
            let token = CancellationToken::new();
            let stop = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        next = rx.recv() => match next {
                            Some(version) => {
                                let digest = Digest::of_bytes(version.as_bytes());
                                versions.publish(version, Some(digest));
                            }
                            None => return,
                        },
                    }
                }
            });
            Ok(token)
        }
    }

    struct Watch {
        state: InstanceState,
        live: Live,
    }

    #[async_trait]
    impl Computable for Watch {
        type Value = Live;

        fn inputs(&self) -> Inputs {
            Inputs::new().str("path", "/srv/site")
        }

        fn scope(&self) -> Scope<'_> {
            Scope::Instance(&self.state)
        }

        async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<Live> {
            Ok(self.live.clone())
        }
    }

    struct Recorder {
        watch: Arc<Watch>,
        records: mpsc::UnboundedSender<Option<Digest>>,
        last: Digest,
        cleaned: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sinkable for Recorder {
        fn inputs(&self) -> Inputs {
            Inputs::new().computable("live", self.watch.clone())
        }

        async fn updated(&self, _ctx: &SinkContext, resolved: &Resolved) -> ComputeResult<Flow> {
            let digest = resolved.digest("live").cloned();
            let done = digest.as_ref() == Some(&self.last);
            let _ = self.records.send(digest);
            Ok(if done { Flow::Stop } else { Flow::Continue })
        }

        async fn cleanup(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_versioned_value_skips_repeats() {
        let codecs = Arc::new(CodecRegistry::with_builtins());
        codecs.register_digestible::<Live>();
        codecs.register_versioned::<Live>();
        let orch = Orchestrator::builder(Arc::new(MemoryCache::new()))
            .with_codecs(codecs)
            .build();

        let d = |s: &str| Digest::of_bytes(s.as_bytes());
        let (versions_tx, versions_rx) = mpsc::unbounded_channel();
        let (records_tx, mut records_rx) = mpsc::unbounded_channel();
        let cleaned = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Recorder {
            watch: Arc::new(Watch {
                state: InstanceState::new(),
                live: Live {
                    versions: Arc::new(Mutex::new(Some(versions_rx))),
                },
            }),
            records: records_tx,
            last: d("three"),
            cleaned: cleaned.clone(),
        });

        let driver = tokio::spawn(async move {
            let mut seen = vec![records_rx.recv().await.flatten()];
            for version in ["one", "two", "one"] {
                versions_tx.send(version.to_string()).unwrap();
                seen.push(records_rx.recv().await.flatten());
            }
            // Same digest as the last dispatched value.
            versions_tx.send("one".to_string()).unwrap();
            versions_tx.send("three".to_string()).unwrap();
            seen.push(records_rx.recv().await.flatten());
            seen
        });

        orch.run(|ctx| async move { continuously(&ctx, sink, None).await })
            .await
            .unwrap();

        let seen = driver.await.unwrap();
        assert_eq!(
            seen,
            vec![
                Some(d("initial")),
                Some(d("one")),
                Some(d("two")),
                Some(d("one")),
                Some(d("three")),
            ]
        );
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_from_outside() {
        struct Stopper;

        #[async_trait]
        impl Sinkable for Stopper {
            fn inputs(&self) -> Inputs {
                Inputs::new()
            }

            async fn updated(&self, ctx: &SinkContext, _resolved: &Resolved) -> ComputeResult<Flow> {
                ctx.spawn_cancelable(|_| async { Err(ComputeError::internal("watcher died")) });
                Ok(Flow::Continue)
            }
        }

        let err = orchestrator()
            .run(|ctx| async move { continuously(&ctx, Arc::new(Stopper), None).await })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("watcher died"));
    }
}
