//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_runtime::{CodecRegistry, Computable, Context, InstanceState, Inputs, Orchestrator, OrchestratorConfig, Resolved, Scope};
use kiln_storage::{Cache, MemoryCache};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route engine logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Orchestrator over `cache` with the built-in codecs
pub fn orchestrator(cache: Arc<dyn Cache>, config: OrchestratorConfig) -> Orchestrator {
    init_tracing();
    Orchestrator::builder(cache)
        .with_codecs(Arc::new(CodecRegistry::with_builtins()))
        .with_config(config)
        .build()
}

/// In-memory orchestrator with default configuration
pub fn memory_orchestrator() -> (Arc<MemoryCache>, Orchestrator) {
    let cache = Arc::new(MemoryCache::new());
    let orch = orchestrator(cache.clone(), OrchestratorConfig::default());
    (cache, orch)
}

/// Squares its input and counts how often it ran
pub struct Square {
    pub n: i64,
    pub calls: Arc<AtomicUsize>,
    pub state: InstanceState,
}

impl Square {
    pub fn new(n: i64, calls: &Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            n,
            calls: calls.clone(),
            state: InstanceState::new(),
        })
    }
}

#[async_trait]
impl Computable for Square {
    type Value = String;

    fn inputs(&self) -> Inputs {
        Inputs::new().json("n", &self.n)
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Instance(&self.state)
    }

    async fn compute(&self, _ctx: &Context, _deps: &Resolved) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok((self.n * self.n).to_string())
    }
}
