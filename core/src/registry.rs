//! Circuit breaker registry keyed by operation name
//!
//! Circuits are created lazily on first use and share one storage backend.
//! Admission and outcome recording each run under a single lock, so the
//! "check state, then act" sequences stay atomic across threads. Callbacks
//! fire after the lock is released.
//!
//! Admission hands out an [`Admission`] guard. Settling it reports the
//! outcome; dropping it unsettled (a cancelled caller) frees any half-open
//! probe slot it held, so the circuit can admit the next probe.

use crate::{
    Event, MemoryStorage, StorageBackend,
    builder::RegistryBuilder,
    callbacks::{Callbacks, Transition},
    circuit::{CircuitBreaker, CircuitState, Config, ProbeTicket},
    classifier::{FailureClassifier, FailureContext},
    errors::{CircuitError, DispatchError},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct CircuitRegistry {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("config", &self.config)
            .field("circuits", &self.circuits.lock().len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl CircuitRegistry {
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, Arc::new(MemoryStorage::new()), None, Callbacks::new())
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn with_parts(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            config,
            storage,
            classifier,
            callbacks,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn with_circuit<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_string()).or_insert_with(|| {
            CircuitBreaker::with_storage(name, self.config.clone(), Arc::clone(&self.storage))
        });
        f(circuit)
    }

    fn notify(&self, name: &str, transition: Option<Transition>) {
        if let Some(transition) = transition {
            self.callbacks.dispatch(name, transition);
        }
    }

    /// Ask whether a call to `name` may proceed
    pub fn try_acquire(&self, name: &str) -> Result<Admission<'_>, CircuitError> {
        match self.with_circuit(name, CircuitBreaker::try_acquire) {
            Ok(admitted) => {
                self.notify(name, admitted.transition);
                Ok(Admission {
                    registry: self,
                    name: name.to_string(),
                    probe: admitted.probe,
                })
            }
            Err(err) => {
                tracing::debug!(operation = name, error = %err, "admission denied");
                Err(err)
            }
        }
    }

    /// Record a success for a call that went through no admission check
    ///
    /// Such an outcome never counts as a half-open probe.
    pub fn record_success(&self, name: &str, duration: Duration) {
        self.settle_success(name, duration, None);
    }

    /// Record a failure for a call that went through no admission check
    pub fn record_failure(&self, name: &str, error: &DispatchError, duration: Duration) {
        self.settle_failure(name, error, duration, None);
    }

    fn settle_success(&self, name: &str, duration: Duration, probe: Option<ProbeTicket>) {
        let transition =
            self.with_circuit(name, |c| c.record_success(duration.as_secs_f64(), probe));
        self.notify(name, transition);
    }

    /// Count a failure unless the classifier ignores it
    fn settle_failure(
        &self,
        name: &str,
        error: &DispatchError,
        duration: Duration,
        probe: Option<ProbeTicket>,
    ) {
        let counts = self.classifier.as_ref().is_none_or(|classifier| {
            classifier.should_trip(&FailureContext {
                circuit_name: name,
                error,
                duration: duration.as_secs_f64(),
            })
        });

        if !counts {
            tracing::debug!(operation = name, error = %error, "failure ignored by classifier");
            if let Some(ticket) = probe {
                self.with_circuit(name, |c| c.release_probe(ticket));
            }
            return;
        }

        let transition =
            self.with_circuit(name, |c| c.record_failure(duration.as_secs_f64(), probe));
        self.notify(name, transition);
    }

    /// Snapshot of a circuit, `None` if the name was never used
    pub fn get_state(&self, name: &str) -> Option<CircuitState> {
        self.circuits.lock().get(name).map(CircuitBreaker::snapshot)
    }

    /// Snapshots of all known circuits, sorted by name
    pub fn states(&self) -> Vec<CircuitState> {
        let mut states: Vec<_> = self
            .circuits
            .lock()
            .values()
            .map(CircuitBreaker::snapshot)
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Manually close a circuit; returns false if the name is unknown
    pub fn reset(&self, name: &str) -> bool {
        let found = match self.circuits.lock().get_mut(name) {
            Some(circuit) => {
                circuit.reset();
                true
            }
            None => false,
        };
        if found {
            tracing::info!(operation = name, "circuit manually reset");
        }
        found
    }

    pub fn reset_all(&self) {
        for circuit in self.circuits.lock().values_mut() {
            circuit.reset();
        }
        self.storage.clear_all();
    }

    pub fn event_log(&self, name: &str, limit: usize) -> Vec<Event> {
        self.storage.event_log(name, limit)
    }
}

/// Permission for one call, settled exactly once
///
/// Dropping it without settling releases a held probe slot and records
/// nothing.
#[must_use = "an admission must be settled with its outcome"]
#[derive(Debug)]
pub struct Admission<'a> {
    registry: &'a CircuitRegistry,
    name: String,
    probe: Option<ProbeTicket>,
}

impl Admission<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn record_success(mut self, duration: Duration) {
        let probe = self.probe.take();
        self.registry.settle_success(&self.name, duration, probe);
    }

    pub fn record_failure(mut self, error: &DispatchError, duration: Duration) {
        let probe = self.probe.take();
        self.registry.settle_failure(&self.name, error, duration, probe);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.probe.take() {
            tracing::debug!(operation = %self.name, "probe abandoned before settling");
            self.registry.with_circuit(&self.name, |c| c.release_probe(ticket));
        }
    }
}
