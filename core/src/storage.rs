//! Storage backends for circuit breaker counters and events
//!
//! `MemoryStorage` keeps, per circuit name, the cumulative failure count,
//! the timestamp of the last failure and a bounded event log. Time is
//! measured on a monotonic clock relative to storage creation.

use crate::{Event, EventKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::time::Instant;

/// Abstract storage backend for circuit breaker bookkeeping
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Record a successful operation; resets the failure count
    fn record_success(&self, circuit_name: &str, duration: f64);

    /// Record a failed operation; increments the failure count
    fn record_failure(&self, circuit_name: &str, duration: f64);

    /// Failures recorded since the last success or clear
    fn failure_count(&self, circuit_name: &str) -> usize;

    /// Monotonic timestamp of the most recent failure
    fn last_failure_at(&self, circuit_name: &str) -> Option<f64>;

    /// Clear all state for a circuit
    fn clear(&self, circuit_name: &str);

    /// Clear all state for all circuits
    fn clear_all(&self);

    /// Get event log for a circuit (limited to last N events)
    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event>;

    /// Get monotonic time in seconds (relative to storage creation)
    fn monotonic_time(&self) -> f64;
}

#[derive(Debug, Default)]
struct CircuitRecord {
    failure_count: usize,
    last_failure_at: Option<f64>,
    events: Vec<Event>,
}

/// Thread-safe in-memory storage for circuit breaker state
#[derive(Debug)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, CircuitRecord>>,
    /// Maximum events to keep per circuit
    max_events: usize,
    /// Monotonic time anchor (prevents clock skew issues from NTP)
    start_time: Instant,
}

impl MemoryStorage {
    /// Create a new storage instance
    pub fn new() -> Self {
        Self::with_max_events(1000)
    }

    /// Create storage with custom max events per circuit
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
            start_time: Instant::now(),
        }
    }

    fn record_event(&self, circuit_name: &str, kind: EventKind, duration: f64) {
        let timestamp = self.monotonic_time();
        let mut records = self.records.write();
        let record = records.entry(circuit_name.to_string()).or_default();

        match kind {
            EventKind::Success => record.failure_count = 0,
            EventKind::Failure => {
                record.failure_count += 1;
                record.last_failure_at = Some(timestamp);
            }
        }

        record.events.push(Event {
            kind,
            timestamp,
            duration,
        });

        // Drop the oldest 10% at once so trimming is not paid on every event
        if record.events.len() > self.max_events {
            let remove_count = (self.max_events / 10).max(1);
            record.events.drain(0..remove_count);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn record_success(&self, circuit_name: &str, duration: f64) {
        self.record_event(circuit_name, EventKind::Success, duration);
    }

    fn record_failure(&self, circuit_name: &str, duration: f64) {
        self.record_event(circuit_name, EventKind::Failure, duration);
    }

    fn failure_count(&self, circuit_name: &str) -> usize {
        self.records
            .read()
            .get(circuit_name)
            .map_or(0, |r| r.failure_count)
    }

    fn last_failure_at(&self, circuit_name: &str) -> Option<f64> {
        self.records
            .read()
            .get(circuit_name)
            .and_then(|r| r.last_failure_at)
    }

    fn clear(&self, circuit_name: &str) {
        self.records.write().remove(circuit_name);
    }

    fn clear_all(&self) {
        self.records.write().clear();
    }

    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event> {
        let records = self.records.read();
        records
            .get(circuit_name)
            .map(|r| {
                let start = r.events.len().saturating_sub(limit);
                r.events[start..].to_vec()
            })
            .unwrap_or_default()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_accumulate_until_success() {
        let storage = MemoryStorage::new();

        storage.record_failure("search", 0.1);
        storage.record_failure("search", 0.2);
        assert_eq!(storage.failure_count("search"), 2);

        storage.record_success("search", 0.1);
        assert_eq!(storage.failure_count("search"), 0);
        assert!(storage.last_failure_at("search").is_some());
    }

    #[test]
    fn test_circuits_are_independent() {
        let storage = MemoryStorage::new();

        storage.record_failure("a", 0.1);
        storage.record_failure("a", 0.1);
        storage.record_failure("b", 0.1);

        assert_eq!(storage.failure_count("a"), 2);
        assert_eq!(storage.failure_count("b"), 1);
        assert_eq!(storage.failure_count("c"), 0);
        assert_eq!(storage.last_failure_at("c"), None);
    }

    #[test]
    fn test_clear() {
        let storage = MemoryStorage::new();

        storage.record_failure("a", 0.1);
        storage.record_failure("b", 0.1);
        storage.clear("a");
        assert_eq!(storage.failure_count("a"), 0);
        assert_eq!(storage.failure_count("b"), 1);

        storage.clear_all();
        assert_eq!(storage.failure_count("b"), 0);
    }

    #[test]
    fn test_event_log_keeps_order_and_limit() {
        let storage = MemoryStorage::new();

        storage.record_success("gen", 0.1);
        storage.record_failure("gen", 0.2);
        storage.record_success("gen", 0.3);

        let log = storage.event_log("gen", 10);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].kind, EventKind::Success);
        assert_eq!(log[1].kind, EventKind::Failure);
        assert_eq!(log[2].kind, EventKind::Success);

        let tail = storage.event_log("gen", 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].kind, EventKind::Failure);
    }

    #[test]
    fn test_small_max_events() {
        let storage = MemoryStorage::with_max_events(5);

        for i in 0..20 {
            storage.record_failure("gen", i as f64 * 0.01);
        }

        assert!(storage.event_log("gen", 100).len() <= 5);
        // Counters are not affected by log trimming
        assert_eq!(storage.failure_count("gen"), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_time_follows_tokio_clock() {
        let storage = MemoryStorage::new();
        let t1 = storage.monotonic_time();

        tokio::time::advance(std::time::Duration::from_secs(2)).await;

        let t2 = storage.monotonic_time();
        assert!(t2 - t1 >= 2.0);
    }
}
