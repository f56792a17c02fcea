//! Explicit owner of the shared orchestration state
//!
//! One `RelayContext` is built per process (or per tenant, or per test) and
//! handed to whatever needs a dispatcher or router. Nothing in this crate
//! is a global.

use crate::{
    MemoryStorage,
    background::BackgroundQueue,
    cache::CacheLayer,
    config::RelayConfig,
    dispatcher::Dispatcher,
    registry::CircuitRegistry,
    router::{HealthReader, StrategyExecutor, StrategyRouter},
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RelayContext {
    config: RelayConfig,
    registry: Arc<CircuitRegistry>,
    dispatcher: Dispatcher,
    background: BackgroundQueue,
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::from_config(RelayConfig::default())
    }
}

impl RelayContext {
    pub fn from_config(config: RelayConfig) -> Self {
        let registry = Arc::new(
            CircuitRegistry::builder()
                .config(config.breaker.circuit_config())
                .storage(Arc::new(MemoryStorage::with_max_events(config.breaker.max_events)))
                .build(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.dispatch.options());

        tracing::debug!(
            max_concurrency = config.dispatch.max_concurrency,
            failure_threshold = config.breaker.failure_threshold,
            "relay context created"
        );

        Self {
            config,
            registry,
            dispatcher,
            background: BackgroundQueue::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CircuitRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.background
    }

    /// A new cache laid out per `[cache]`; share it by cloning the `Arc`
    pub fn cache<V: Clone>(&self) -> Arc<CacheLayer<V>> {
        Arc::new(self.config.cache.build())
    }

    /// A router over this context's dispatcher, writing into `cache`
    pub fn router<R>(
        &self,
        cache: Arc<CacheLayer<R>>,
        executor: Arc<dyn StrategyExecutor<R>>,
        health: Arc<dyn HealthReader>,
    ) -> StrategyRouter<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        StrategyRouter::new(self.dispatcher.clone(), cache, executor, health)
            .with_settings(self.config.router.clone())
    }
}
