//! Concurrent operation dispatcher
//!
//! A batch of named operations runs as overlapping futures under one
//! concurrency window. Each operation is gated by its circuit, retried with
//! backoff, raced against its timeout, and settles into exactly one
//! [`OperationResult`]. Results come back in input order.

use crate::{
    backoff::{RetryDecision, RetryPolicy},
    bulkhead::BulkheadSemaphore,
    errors::{BoxError, DispatchError},
    registry::{Admission, CircuitRegistry},
    timeout::{TimeoutBehavior, with_timeout},
};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type ActionFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;
type FallbackFn<T> = Arc<dyn Fn() -> Result<T, BoxError> + Send + Sync>;

/// One named unit of work submitted to the dispatcher
pub struct OperationDescriptor<T> {
    pub(crate) name: String,
    action: ActionFn<T>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    required: bool,
    fallback: Option<FallbackFn<T>>,
}

impl<T> Clone for OperationDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: Arc::clone(&self.action),
            timeout: self.timeout,
            max_retries: self.max_retries,
            required: self.required,
            fallback: self.fallback.clone(),
        }
    }
}

impl<T> std::fmt::Debug for OperationDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("required", &self.required)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<T: Send + 'static> OperationDescriptor<T> {
    /// Describe an operation; `action` is called once per attempt
    pub fn new<F, Fut, E>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move || action().map(|r| r.map_err(Into::<BoxError>::into)).boxed()),
            timeout: None,
            max_retries: None,
            required: false,
            fallback: None,
        }
    }

    /// Per-attempt deadline; defaults to the dispatcher's
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retries after the first attempt; defaults to the dispatcher's
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Synchronous substitute used once every attempt has failed
    pub fn fallback<F, E>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        self.fallback = Some(Arc::new(move || fallback().map_err(Into::<BoxError>::into)));
        self
    }

    /// Fallback that always yields a copy of `value`
    pub fn fallback_value(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.fallback(move || Ok::<_, BoxError>(value.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How an operation settled
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failed(DispatchError),
    TimedOut(DispatchError),
    FallbackUsed(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
    Timeout,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult<T> {
    pub name: String,
    pub outcome: Outcome<T>,
    pub duration: Duration,
    /// Attempts made beyond the first
    pub retry_count: u32,
    pub required: bool,
}

impl<T> OperationResult<T> {
    pub fn status(&self) -> OperationStatus {
        match self.outcome {
            Outcome::Success(_) => OperationStatus::Success,
            Outcome::Failed(_) => OperationStatus::Failed,
            Outcome::TimedOut(_) => OperationStatus::Timeout,
            Outcome::FallbackUsed(_) => OperationStatus::Fallback,
        }
    }

    /// A value was produced, by the action or by its fallback
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_) | Outcome::FallbackUsed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Success(v) | Outcome::FallbackUsed(v) => Some(v),
            Outcome::Failed(_) | Outcome::TimedOut(_) => None,
        }
    }

    pub fn error(&self) -> Option<&DispatchError> {
        match &self.outcome {
            Outcome::Failed(e) | Outcome::TimedOut(e) => Some(e),
            Outcome::Success(_) | Outcome::FallbackUsed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, DispatchError> {
        match self.outcome {
            Outcome::Success(v) | Outcome::FallbackUsed(v) => Ok(v),
            Outcome::Failed(e) | Outcome::TimedOut(e) => Err(e),
        }
    }
}

/// Batch-wide defaults for a dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Operations of one batch allowed in flight at once
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub retry: RetryPolicy,
    pub timeout_behavior: TimeoutBehavior,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_timeout: Duration::from_secs(30),
            default_max_retries: 2,
            retry: RetryPolicy::default(),
            timeout_behavior: TimeoutBehavior::default(),
        }
    }
}

enum AttemptError {
    TimedOut(DispatchError),
    Failed(String),
}

/// Turn a caught panic into an ordinary error
fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("panicked: {message}").into()
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<CircuitRegistry>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<CircuitRegistry>, options: DispatchOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<CircuitRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Run a batch; one result per descriptor, in input order
    ///
    /// A failing or panicking operation never cancels its siblings.
    /// Operations whose circuit rejects them are reported as
    /// `Failed(CircuitOpen)` without their action being called. Dropping the
    /// returned future abandons unsettled operations and frees any half-open
    /// probe slots they held.
    pub async fn execute_concurrently<T>(
        &self,
        operations: Vec<OperationDescriptor<T>>,
    ) -> Vec<OperationResult<T>>
    where
        T: Send + 'static,
    {
        let mut slots: Vec<Option<OperationResult<T>>> = Vec::new();
        slots.resize_with(operations.len(), || None);

        let window = BulkheadSemaphore::new(self.options.max_concurrency.max(1));
        let mut running = FuturesUnordered::new();

        for (index, op) in operations.into_iter().enumerate() {
            match self.registry.try_acquire(&op.name) {
                Ok(admission) => {
                    let window = window.clone();
                    running.push(async move {
                        let _permit = window.acquire().await;
                        (index, self.run(op, admission).await)
                    });
                }
                Err(err) => {
                    tracing::warn!(operation = %op.name, error = %err, "skipping operation");
                    slots[index] = Some(OperationResult {
                        outcome: Outcome::Failed(DispatchError::CircuitOpen {
                            name: op.name.clone(),
                        }),
                        name: op.name,
                        duration: Duration::ZERO,
                        retry_count: 0,
                        required: op.required,
                    });
                }
            }
        }

        while let Some((index, result)) = running.next().await {
            slots[index] = Some(result);
        }

        slots.into_iter().flatten().collect()
    }

    /// Run a single operation through the same path as a batch of one
    pub async fn execute<T>(&self, operation: OperationDescriptor<T>) -> OperationResult<T>
    where
        T: Send + 'static,
    {
        let name = operation.name.clone();
        let required = operation.required;
        self.execute_concurrently(vec![operation])
            .await
            .pop()
            .unwrap_or_else(|| OperationResult {
                outcome: Outcome::Failed(DispatchError::CircuitOpen { name: name.clone() }),
                name,
                duration: Duration::ZERO,
                retry_count: 0,
                required,
            })
    }

    async fn run<T>(
        &self,
        op: OperationDescriptor<T>,
        admission: Admission<'_>,
    ) -> OperationResult<T>
    where
        T: Send + 'static,
    {
        let timeout = op.timeout.unwrap_or(self.options.default_timeout);
        let max_retries = op.max_retries.unwrap_or(self.options.default_max_retries);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        let last_error = loop {
            attempts += 1;
            tracing::debug!(operation = %op.name, attempt = attempts, "attempt started");

            let error = match self.attempt(&op, timeout).await {
                Ok(value) => {
                    let duration = started.elapsed();
                    admission.record_success(duration);
                    tracing::debug!(
                        operation = %op.name,
                        attempt = attempts,
                        ?duration,
                        "operation succeeded"
                    );
                    return OperationResult {
                        name: op.name,
                        outcome: Outcome::Success(value),
                        duration,
                        retry_count: attempts - 1,
                        required: op.required,
                    };
                }
                Err(error) => error,
            };

            match self.options.retry.decide(attempts, max_retries) {
                RetryDecision::Retry { attempt, delay } => {
                    tracing::debug!(
                        operation = %op.name,
                        retry = attempt,
                        ?delay,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => break error,
            }
        };

        let error = match last_error {
            AttemptError::TimedOut(error) => error,
            AttemptError::Failed(message) => DispatchError::OperationFailed {
                name: op.name.clone(),
                last_error: message,
                attempts,
            },
        };
        tracing::warn!(operation = %op.name, attempts, error = %error, "operation exhausted");
        admission.record_failure(&error, started.elapsed());

        let outcome = match &op.fallback {
            Some(fallback) => {
                let produced = std::panic::catch_unwind(AssertUnwindSafe(|| fallback()))
                    .unwrap_or_else(|payload| Err(panic_error(payload)));
                match produced {
                    Ok(value) => {
                        tracing::info!(operation = %op.name, "fallback used");
                        Outcome::FallbackUsed(value)
                    }
                    Err(fallback_error) => {
                        tracing::warn!(
                            operation = %op.name,
                            error = %fallback_error,
                            "fallback failed"
                        );
                        Outcome::Failed(DispatchError::FallbackFailed {
                            name: op.name.clone(),
                            fallback_error: fallback_error.to_string(),
                        })
                    }
                }
            }
            None if error.is_timeout() => Outcome::TimedOut(error),
            None => Outcome::Failed(error),
        };

        OperationResult {
            name: op.name,
            outcome,
            duration: started.elapsed(),
            retry_count: attempts - 1,
            required: op.required,
        }
    }

    async fn attempt<T>(
        &self,
        op: &OperationDescriptor<T>,
        timeout: Duration,
    ) -> Result<T, AttemptError>
    where
        T: Send + 'static,
    {
        let future = (op.action)();
        let settled = match self.options.timeout_behavior {
            // The handle is dropped on timeout; the task keeps running
            TimeoutBehavior::Detach => with_timeout(tokio::spawn(future), timeout, &op.name)
                .await
                .map(|joined| joined.map_err(BoxError::from).and_then(|r| r)),
            TimeoutBehavior::Cancel => {
                with_timeout(AssertUnwindSafe(future).catch_unwind(), timeout, &op.name)
                    .await
                    .map(|caught| caught.unwrap_or_else(|payload| Err(panic_error(payload))))
            }
        };

        match settled {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                tracing::debug!(operation = %op.name, error = %error, "attempt failed");
                Err(AttemptError::Failed(error.to_string()))
            }
            Err(error) => {
                tracing::warn!(
                    operation = %op.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "attempt timed out"
                );
                Err(AttemptError::TimedOut(error))
            }
        }
    }
}

/// Caller-side batch check
///
/// Returns `RequiredOperationMissing` naming every required operation that
/// produced neither a success nor a fallback value.
pub fn ensure_required<T>(results: &[OperationResult<T>]) -> Result<(), DispatchError> {
    let names: Vec<String> = results
        .iter()
        .filter(|r| r.required && !r.is_ok())
        .map(|r| r.name.clone())
        .collect();

    if names.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::RequiredOperationMissing { names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn fast_options() -> DispatchOptions {
        DispatchOptions {
            retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            ..DispatchOptions::default()
        }
    }

    fn dispatcher(threshold: usize) -> Dispatcher {
        let registry = CircuitRegistry::builder().failure_threshold(threshold).build();
        Dispatcher::new(Arc::new(registry), fast_options())
    }

    fn counting_failure(name: &str, calls: &Arc<AtomicUsize>) -> OperationDescriptor<u32> {
        let calls = Arc::clone(calls);
        OperationDescriptor::new(name, move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>("backend unavailable") }
        })
    }

    fn ok(name: &str, value: u32) -> OperationDescriptor<u32> {
        OperationDescriptor::new(name, move || async move { Ok::<_, BoxError>(value) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_action_invoked_max_retries_plus_one_times() {
        let dispatcher = dispatcher(100);

        for retries in [0u32, 1, 3] {
            let calls = Arc::new(AtomicUsize::new(0));
            let op = counting_failure("flaky", &calls).max_retries(retries);
            let result = dispatcher.execute(op).await;

            assert_eq!(calls.load(Ordering::SeqCst), retries as usize + 1);
            assert_eq!(result.retry_count, retries);
            assert_eq!(
                result.outcome,
                Outcome::Failed(DispatchError::OperationFailed {
                    name: "flaky".to_string(),
                    last_error: "backend unavailable".to_string(),
                    attempts: retries + 1,
                })
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failure() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let op = OperationDescriptor::new("transient", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err::<u32, BoxError>("not yet".into())
                } else {
                    Ok(7)
                }
            }
        })
        .max_retries(2);

        let result = dispatcher.execute(op).await;
        assert_eq!(result.outcome, Outcome::Success(7));
        assert_eq!(result.retry_count, 2);
        assert_eq!(
            dispatcher.registry().get_state("transient").map(|s| s.failure_count),
            Some(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_reported_by_batch_check() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let results = dispatcher
            .execute_concurrently(vec![
                ok("outline", 1),
                counting_failure("draft", &calls).required(true).max_retries(1),
                ok("review", 3),
            ])
            .await;

        let statuses: Vec<_> = results.iter().map(OperationResult::status).collect();
        assert_eq!(
            statuses,
            vec![OperationStatus::Success, OperationStatus::Failed, OperationStatus::Success]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            ensure_required(&results),
            Err(DispatchError::RequiredOperationMissing {
                names: vec!["draft".to_string()],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_naming_operation_and_bound() {
        let dispatcher = dispatcher(5);
        let op = OperationDescriptor::new("generate", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, BoxError>(1u32)
        })
        .timeout(Duration::from_millis(100))
        .max_retries(0);

        let result = dispatcher.execute(op).await;
        assert_eq!(result.status(), OperationStatus::Timeout);

        let error = result.error().expect("timeout error");
        assert_eq!(
            error,
            &DispatchError::OperationTimeout {
                name: "generate".to_string(),
                timeout_ms: 100,
            }
        );
        assert!(error.to_string().contains("generate"));
        assert!(error.to_string().contains("100ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_later_submission() {
        let dispatcher = dispatcher(3);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let results = dispatcher
                .execute_concurrently(vec![counting_failure("X", &calls).max_retries(0)])
                .await;
            assert_eq!(results[0].status(), OperationStatus::Failed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let results = dispatcher
            .execute_concurrently(vec![counting_failure("X", &calls).max_retries(0), ok("Y", 2)])
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3, "action must not be invoked");
        assert_eq!(
            results[0].outcome,
            Outcome::Failed(DispatchError::CircuitOpen { name: "X".to_string() })
        );
        assert_eq!(results[1].outcome, Outcome::Success(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_circuit() {
        let registry = CircuitRegistry::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(5))
            .build();
        let dispatcher = Dispatcher::new(Arc::new(registry), fast_options());
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher.execute(counting_failure("svc", &calls).max_retries(0)).await;
        let rejected = dispatcher.execute(ok("svc", 1)).await;
        assert!(rejected.error().is_some_and(DispatchError::is_circuit_open));

        tokio::time::advance(Duration::from_secs(5)).await;
        let probe = dispatcher.execute(ok("svc", 1)).await;
        assert_eq!(probe.outcome, Outcome::Success(1));
        assert!(dispatcher.registry().get_state("svc").is_some_and(|s| !s.is_open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let dispatcher = dispatcher(5);
        let ops = (0..4u32)
            .map(|i| {
                OperationDescriptor::new(format!("op{i}"), move || async move {
                    tokio::time::sleep(Duration::from_millis(u64::from(40 - i * 10))).await;
                    Ok::<_, BoxError>(i)
                })
            })
            .collect();

        let results = dispatcher.execute_concurrently(ops).await;
        let values: Vec<_> = results.iter().filter_map(|r| r.value().copied()).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
        assert_eq!(results[2].name, "op2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_window_bounds_in_flight_operations() {
        let registry = Arc::new(CircuitRegistry::default());
        let options = DispatchOptions {
            max_concurrency: 2,
            ..fast_options()
        };
        let dispatcher = Dispatcher::new(registry, options);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops = (0..6)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                OperationDescriptor::new(format!("op{i}"), move || {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(())
                    }
                })
            })
            .collect();

        let results = dispatcher.execute_concurrently(ops).await;
        assert!(results.iter().all(OperationResult::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_operation_does_not_block_siblings() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let results = dispatcher
            .execute_concurrently(vec![
                counting_failure("broken", &calls).max_retries(3),
                OperationDescriptor::new("steady", || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, BoxError>(5u32)
                }),
            ])
            .await;

        assert_eq!(results[0].status(), OperationStatus::Failed);
        assert_eq!(results[1].outcome, Outcome::Success(5));
        assert!(results[1].duration < Duration::from_millis(30));
        assert!(started.elapsed() >= Duration::from_millis(70), "backoff delays elapsed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_after_exhaustion() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = dispatcher
            .execute(counting_failure("enrich", &calls).max_retries(1).fallback_value(0))
            .await;

        assert_eq!(result.outcome, Outcome::FallbackUsed(0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(ensure_required(std::slice::from_ref(&result)).is_ok());
        // The action still failed, so the circuit counts it
        assert_eq!(
            dispatcher.registry().get_state("enrich").map(|s| s.failure_count),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_fallback_reported() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = dispatcher
            .execute(
                counting_failure("enrich", &calls)
                    .max_retries(0)
                    .required(true)
                    .fallback(|| Err::<u32, _>("no default")),
            )
            .await;

        assert_eq!(
            result.outcome,
            Outcome::Failed(DispatchError::FallbackFailed {
                name: "enrich".to_string(),
                fallback_error: "no default".to_string(),
            })
        );
        assert!(ensure_required(&[result]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_attempt_keeps_running_after_timeout() {
        let dispatcher = dispatcher(5);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let op = OperationDescriptor::new("slow", move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .timeout(Duration::from_millis(50))
        .max_retries(0);

        assert_eq!(dispatcher.execute(op).await.status(), OperationStatus::Timeout);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_attempt_is_dropped_on_timeout() {
        let registry = Arc::new(CircuitRegistry::default());
        let options = DispatchOptions {
            timeout_behavior: TimeoutBehavior::Cancel,
            ..fast_options()
        };
        let dispatcher = Dispatcher::new(registry, options);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let op = OperationDescriptor::new("slow", move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .timeout(Duration::from_millis(50))
        .max_retries(0);

        assert_eq!(dispatcher.execute(op).await.status(), OperationStatus::Timeout);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_counts_as_failure() {
        let dispatcher = dispatcher(5);
        let op = OperationDescriptor::new("explodes", || async {
            if true {
                panic!("kaboom");
            }
            Ok::<u32, BoxError>(0)
        })
        .max_retries(0);

        let result = dispatcher.execute(op).await;
        assert_eq!(result.status(), OperationStatus::Failed);
        assert_eq!(
            dispatcher.registry().get_state("explodes").map(|s| s.failure_count),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_cancel_mode_keeps_sibling_results() {
        let options = DispatchOptions {
            timeout_behavior: TimeoutBehavior::Cancel,
            ..fast_options()
        };
        let dispatcher = Dispatcher::new(Arc::new(CircuitRegistry::default()), options);

        let explodes = OperationDescriptor::new("boom", || async {
            if true {
                panic!("kaboom");
            }
            Ok::<u32, BoxError>(0)
        })
        .max_retries(0);

        let results = tokio::spawn(async move {
            dispatcher
                .execute_concurrently(vec![ok("sibling", 1), explodes])
                .await
        })
        .await
        .expect("batch survives the panic");

        assert_eq!(results[0].outcome, Outcome::Success(1));
        match &results[1].outcome {
            Outcome::Failed(DispatchError::OperationFailed { last_error, .. }) => {
                assert!(last_error.contains("kaboom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fallback_reported_as_fallback_failure() {
        let dispatcher = dispatcher(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = dispatcher
            .execute(
                counting_failure("enrich", &calls)
                    .max_retries(0)
                    .fallback(|| -> Result<u32, BoxError> { panic!("no default") }),
            )
            .await;

        match result.outcome {
            Outcome::Failed(DispatchError::FallbackFailed { fallback_error, .. }) => {
                assert!(fallback_error.contains("no default"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn probing_registry() -> Arc<CircuitRegistry> {
        Arc::new(
            CircuitRegistry::builder()
                .failure_threshold(1)
                .reset_timeout(Duration::from_secs(1))
                .build(),
        )
    }

    fn sleepy(name: &str, delay: Duration, value: u32) -> OperationDescriptor<u32> {
        OperationDescriptor::new(name, move || async move {
            tokio::time::sleep(delay).await;
            Ok::<_, BoxError>(value)
        })
        .max_retries(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_half_open_batch_does_not_wedge_circuit() {
        let dispatcher = Dispatcher::new(probing_registry(), fast_options());
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher.execute(counting_failure("svc", &calls).max_retries(0)).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        // The caller gives up on the probing batch and drops it
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.execute(sleepy("svc", Duration::from_secs(10), 1)),
        )
        .await;
        assert!(abandoned.is_err());

        let state = dispatcher.registry().get_state("svc").expect("svc exists");
        assert_eq!(state.half_open_probes_used, 0);

        let next = dispatcher.execute(ok("svc", 2)).await;
        assert_eq!(next.outcome, Outcome::Success(2));
        assert!(dispatcher.registry().get_state("svc").is_some_and(|s| !s.is_open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_from_closed_admission_leaves_half_open_pending() {
        let dispatcher = Dispatcher::new(probing_registry(), fast_options());
        let calls = Arc::new(AtomicUsize::new(0));

        let stale = dispatcher.execute(sleepy("svc", Duration::from_secs(3), 1));
        let failing = dispatcher.execute(counting_failure("svc", &calls).max_retries(0));
        let probe = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            dispatcher.execute(sleepy("svc", Duration::from_secs(10), 3)).await
        };
        let checkpoint = async {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            dispatcher.registry().get_state("svc")
        };

        let (stale, failing, probe, during) = tokio::join!(stale, failing, probe, checkpoint);
        assert_eq!(stale.outcome, Outcome::Success(1));
        assert_eq!(failing.status(), OperationStatus::Failed);

        let during = during.expect("svc exists");
        assert_eq!(during.status, crate::CircuitStatus::HalfOpen);
        assert_eq!(during.half_open_probes_used, 1);

        assert_eq!(probe.outcome, Outcome::Success(3));
        assert!(dispatcher.registry().get_state("svc").is_some_and(|s| !s.is_open));
    }
}
