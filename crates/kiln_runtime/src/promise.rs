//! Single-resolution results with waiter fan-out.
//!
//! A [`Promise`] is resolved at most once. Any number of [`Future`]s may wait
//! on it; waiters that arrive after resolution see the result immediately.

use crate::error::{ComputeError, ComputeResult};
use chrono::{DateTime, Utc};
use kiln_core::{ActionId, Digest};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Type-erased computed value
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// A computed value with its provenance
#[derive(Debug, Clone)]
pub struct Computed<V> {
    /// The value
    pub value: V,
    /// Output digest, when the value type can produce one
    pub digest: Option<Digest>,
    /// Produced by a node whose output is marked non-deterministic
    pub non_deterministic: bool,
    /// Served from the cache
    pub cached: bool,
    /// When the value was produced
    pub completed: DateTime<Utc>,
    pub(crate) revision: u64,
}

impl<V> Computed<V> {
    /// A freshly produced value
    #[must_use]
    pub fn new(value: V, digest: Option<Digest>) -> Self {
        Self {
            value,
            digest,
            non_deterministic: false,
            cached: false,
            completed: Utc::now(),
            revision: 0,
        }
    }

    /// Observable revision this value was published under (0 outside continuous mode)
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace the value, keeping the metadata
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Computed<U> {
        Computed {
            value: f(self.value),
            digest: self.digest,
            non_deterministic: self.non_deterministic,
            cached: self.cached,
            completed: self.completed,
            revision: self.revision,
        }
    }
}

impl Computed<AnyValue> {
    /// Erase a typed value
    #[must_use]
    pub fn erase<V: Any + Send + Sync>(typed: Computed<V>) -> Self {
        typed.map(|v| Arc::new(v) as AnyValue)
    }

    /// Recover the concrete value
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Internal`] if the value is of another type
    pub fn downcast<V: Any + Clone + Send + Sync>(self) -> ComputeResult<Computed<V>> {
        let Computed {
            value,
            digest,
            non_deterministic,
            cached,
            completed,
            revision,
        } = self;

        let typed = value.downcast::<V>().map_err(|_| {
            ComputeError::internal(format!(
                "computed value is not a {}",
                std::any::type_name::<V>()
            ))
        })?;

        Ok(Computed {
            value: Arc::unwrap_or_clone(typed),
            digest,
            non_deterministic,
            cached,
            completed,
            revision,
        })
    }
}

type Slot<T> = Option<ComputeResult<Computed<T>>>;

/// Write side of a single-resolution result
#[derive(Debug)]
pub struct Promise<T> {
    id: ActionId,
    state: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Create an unresolved promise attributed to `id`
    #[must_use]
    pub fn new(id: ActionId) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            id,
            state: Arc::new(state),
        }
    }

    /// Promise already resolved with `result`
    #[must_use]
    pub fn resolved(id: ActionId, result: ComputeResult<Computed<T>>) -> Self {
        let promise = Self::new(id);
        promise.resolve(result);
        promise
    }

    /// Promise already failed with `err`
    #[must_use]
    pub fn failed(err: ComputeError) -> Self {
        Self::resolved(ActionId::new(), Err(err))
    }

    /// Provenance id of the computation behind this promise
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.id
    }

    /// Resolve the promise. Returns `false` (and changes nothing) if it was
    /// already resolved.
    pub fn resolve(&self, result: ComputeResult<Computed<T>>) -> bool {
        let mut result = Some(result);
        self.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    /// Resolve with an error
    pub fn fail(&self, err: ComputeError) -> bool {
        self.resolve(Err(err))
    }

    /// Whether a result is available
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The result, if already available
    #[must_use]
    pub fn peek(&self) -> Option<ComputeResult<Computed<T>>> {
        self.state.borrow().clone()
    }

    /// Obtain a waiter
    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future {
            id: self.id,
            rx: self.state.subscribe(),
        }
    }
}

/// Read side of a [`Promise`]
#[derive(Debug)]
pub struct Future<T> {
    id: ActionId,
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> Future<T> {
    /// Provenance id of the awaited computation
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.id
    }

    /// Wait for the result.
    ///
    /// # Errors
    ///
    /// Returns the error the promise was resolved with, or
    /// [`ComputeError::Internal`] if the promise was dropped unresolved.
    pub async fn wait(mut self) -> ComputeResult<Computed<T>> {
        let slot = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ComputeError::internal("promise dropped before resolution"))?;

        match slot.as_ref() {
            Some(result) => result.clone(),
            None => Err(ComputeError::internal("promise resolved without a value")),
        }
    }

    /// Wait for the result, giving up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`Future::wait`], plus [`ComputeError::Cancelled`].
    pub async fn wait_with(self, cancel: &CancellationToken) -> ComputeResult<Computed<T>> {
        tokio::select! {
            biased;
            result = self.wait() => result,
            _ = cancel.cancelled() => Err(ComputeError::Cancelled),
        }
    }
}
