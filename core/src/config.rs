//! TOML configuration for the dispatcher, breakers, cache and router
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration. Durations are milliseconds. Validation is a separate pass
//! that reports every problem at once.

use crate::{
    backoff::RetryPolicy,
    cache::{CacheLayer, namespaces},
    circuit::Config as CircuitConfig,
    dispatcher::DispatchOptions,
    router::RouterSettings,
    timeout::TimeoutBehavior,
};

/// Largest jitter the backoff bounds allow
const MAX_JITTER: f64 = crate::backoff::DEFAULT_MAX_JITTER;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dispatch: DispatchConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub router: RouterSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_concurrency: usize,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter: f64,
    pub timeout_behavior: TimeoutBehavior,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_timeout_ms: 30_000,
            default_max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_jitter: 0.1,
            timeout_behavior: TimeoutBehavior::Detach,
        }
    }
}

impl DispatchConfig {
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            max_concurrency: self.max_concurrency,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            default_max_retries: self.default_max_retries,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                max_jitter: self.max_jitter,
            },
            timeout_behavior: self.timeout_behavior,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout_ms: u64,
    pub success_threshold: usize,
    pub half_open_max_probes: usize,
    pub jitter_factor: f64,
    /// Events kept per circuit in the in-memory log
    pub max_events: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 1,
            half_open_max_probes: 1,
            jitter_factor: 0.0,
            max_events: 1_000,
        }
    }
}

impl BreakerConfig {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout_secs: self.reset_timeout_ms as f64 / 1000.0,
            success_threshold: self.success_threshold,
            half_open_max_probes: self.half_open_max_probes,
            jitter_factor: self.jitter_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl_ms: u64,
    /// Per-namespace TTL overrides
    pub namespaces: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            default_ttl_ms: 300_000,
            namespaces: BTreeMap::from([
                (namespaces::CONTEXT.to_string(), 600_000),
                (namespaces::WEB_SEARCH.to_string(), 900_000),
                (namespaces::GENERATED_ARTIFACT.to_string(), 3_600_000),
            ]),
        }
    }
}

impl CacheConfig {
    pub fn build<V: Clone>(&self) -> CacheLayer<V> {
        self.namespaces.iter().fold(
            CacheLayer::new(self.max_entries, Duration::from_millis(self.default_ttl_ms)),
            |cache, (namespace, ttl_ms)| {
                cache.with_namespace(namespace.clone(), Duration::from_millis(*ttl_ms))
            },
        )
    }
}

/// A single semantic problem in a configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl RelayConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges, returning every violation
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: message.to_string(),
                });
            }
        };

        let d = &self.dispatch;
        check(d.max_concurrency > 0, "dispatch.max_concurrency", "must be greater than 0");
        check(d.default_timeout_ms > 0, "dispatch.default_timeout_ms", "must be greater than 0");
        check(
            d.base_delay_ms <= d.max_delay_ms,
            "dispatch.base_delay_ms",
            "must not exceed dispatch.max_delay_ms",
        );
        check(
            (0.0..=MAX_JITTER).contains(&d.max_jitter),
            "dispatch.max_jitter",
            "must be in [0, 0.1] so delays stay within 10% above the exponential base",
        );

        let b = &self.breaker;
        check(b.failure_threshold > 0, "breaker.failure_threshold", "must be greater than 0");
        check(b.reset_timeout_ms > 0, "breaker.reset_timeout_ms", "must be greater than 0");
        check(b.success_threshold > 0, "breaker.success_threshold", "must be greater than 0");
        check(b.half_open_max_probes > 0, "breaker.half_open_max_probes", "must be greater than 0");
        check(
            (0.0..=1.0).contains(&b.jitter_factor),
            "breaker.jitter_factor",
            "must be in [0, 1]",
        );
        check(b.max_events > 0, "breaker.max_events", "must be greater than 0");

        let c = &self.cache;
        check(c.max_entries > 0, "cache.max_entries", "must be greater than 0");
        check(c.default_ttl_ms > 0, "cache.default_ttl_ms", "must be greater than 0");
        for (namespace, ttl_ms) in &c.namespaces {
            check(
                *ttl_ms > 0,
                &format!("cache.namespaces.{namespace}"),
                "TTL must be greater than 0",
            );
        }

        let r = &self.router;
        check(r.peak_start_hour < 24, "router.peak_start_hour", "must be an hour in 0..24");
        check(r.peak_end_hour <= 24, "router.peak_end_hour", "must be an hour in 0..=24");
        check(r.strategy_timeout_ms > 0, "router.strategy_timeout_ms", "must be greater than 0");
        check(!r.cache_namespace.is_empty(), "router.cache_namespace", "must not be empty");

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
