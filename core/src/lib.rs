//! RelayMachines - resilient concurrent orchestration
//!
//! This crate runs batches of failure-prone async operations with:
//! - Bounded concurrency per batch (approximate, not FIFO admission)
//! - Per-attempt timeouts and retry with exponential backoff and jitter
//! - Per-operation circuit breakers (Closed → Open → HalfOpen) built on
//!   `state-machines`, with monotonic time tracking
//! - A namespaced TTL + LRU cache for intermediate results
//! - A scoring router that picks an execution strategy and falls back to
//!   the alternate one exactly once
//!
//! # Example
//!
//! ```rust
//! use relay_machines::{
//!     BoxError, CircuitRegistry, DispatchOptions, Dispatcher, OperationDescriptor,
//!     OperationStatus, ensure_required,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Arc::new(CircuitRegistry::builder().failure_threshold(3).build());
//! let dispatcher = Dispatcher::new(registry, DispatchOptions::default());
//!
//! let results = dispatcher
//!     .execute_concurrently(vec![
//!         OperationDescriptor::new("outline", || async { Ok::<_, BoxError>("ok") })
//!             .required(true),
//!         OperationDescriptor::new("related", || async { Err::<&str, _>("search down") })
//!             .timeout(Duration::from_secs(5))
//!             .max_retries(0)
//!             .fallback_value("no related items"),
//!     ])
//!     .await;
//!
//! assert_eq!(results[0].status(), OperationStatus::Success);
//! assert_eq!(results[1].status(), OperationStatus::Fallback);
//! assert!(ensure_required(&results).is_ok());
//! # }
//! ```

pub mod backoff;
pub mod background;
pub mod builder;
pub mod bulkhead;
pub mod cache;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod router;
pub mod storage;
pub mod timeout;

pub use backoff::{RetryDecision, RetryPolicy};
pub use background::{BackgroundMetrics, BackgroundQueue};
pub use builder::RegistryBuilder;
pub use bulkhead::{BulkheadGuard, BulkheadSemaphore};
pub use cache::{CacheEntry, CacheLayer, CacheMetrics, LazyDataset};
pub use callbacks::Transition;
pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus, Config, ProbeTicket};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use config::{ConfigError, RelayConfig};
pub use context::RelayContext;
pub use dispatcher::{
    DispatchOptions, Dispatcher, OperationDescriptor, OperationResult, OperationStatus, Outcome,
    ensure_required,
};
pub use errors::{BoxError, CircuitError, DispatchError};
pub use registry::{Admission, CircuitRegistry};
pub use router::{
    HealthReader, QualityTarget, RouteDecision, RouteRequest, RoutedResult, RouterSettings,
    RouterWeights, StaticHealth, Strategy, StrategyExecutor, StrategyRouter, SystemHealth, Urgency,
};
pub use storage::{MemoryStorage, StorageBackend};
pub use timeout::{TimeoutBehavior, with_timeout};

/// Event type for circuit breaker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Success,
    Failure,
}

/// A single outcome recorded against a circuit
#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Seconds since the storage backend was created
    pub timestamp: f64,
    pub duration: f64,
}
