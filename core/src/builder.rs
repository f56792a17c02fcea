//! Builder API for ergonomic circuit registry configuration

use crate::{
    MemoryStorage, StorageBackend,
    callbacks::Callbacks,
    circuit::Config,
    classifier::FailureClassifier,
    registry::CircuitRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit registries with fluent API
///
/// Every circuit created by the registry shares the configuration set here.
///
/// ```rust
/// use relay_machines::CircuitRegistry;
/// use std::time::Duration;
///
/// let registry = CircuitRegistry::builder()
///     .failure_threshold(3)
///     .reset_timeout(Duration::from_secs(10))
///     .on_open(|name| eprintln!("circuit {name} opened"))
///     .build();
///
/// assert!(registry.try_acquire("search").is_ok());
/// ```
pub struct RegistryBuilder {
    config: Config,
    storage: Option<Arc<dyn StorageBackend>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            storage: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole circuit configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the cumulative failure threshold (number of failures to open circuit)
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    /// Set the time an open circuit waits after its last failure
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set the reset timeout in seconds
    pub fn reset_timeout_secs(mut self, seconds: f64) -> Self {
        self.config.reset_timeout_secs = seconds;
        self
    }

    /// Set the success threshold (successes needed to close from half-open)
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold.max(1);
        self
    }

    /// Set how many probes may be in flight while half-open
    pub fn half_open_max_probes(mut self, probes: usize) -> Self {
        self.config.half_open_max_probes = probes.max(1);
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Set custom storage backend
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set a failure classifier to filter which errors should trip circuits
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when a circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> CircuitRegistry {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        CircuitRegistry::with_parts(
            self.config,
            storage,
            self.failure_classifier,
            self.callbacks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let registry = RegistryBuilder::new().build();
        assert_eq!(registry.config(), &Config::default());
    }

    #[test]
    fn test_builder_custom_config() {
        let registry = RegistryBuilder::new()
            .failure_threshold(10)
            .reset_timeout_secs(60.0)
            .success_threshold(3)
            .half_open_max_probes(2)
            .jitter_factor(1.5)
            .build();

        let config = registry.config();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.reset_timeout(), Duration::from_secs(60));
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.half_open_max_probes, 2);
        assert_eq!(config.jitter_factor, 1.0);
    }

    #[test]
    fn test_builder_shared_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = RegistryBuilder::new()
            .storage(storage.clone())
            .failure_threshold(2)
            .build();

        storage.record_failure("x", 0.1);
        storage.record_failure("x", 0.1);
        assert_eq!(registry.event_log("x", 10).len(), 2);
    }
}
