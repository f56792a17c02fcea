//! Circuit breaker implementation using state machines
//!
//! One `CircuitBreaker` guards one operation name. It never runs the
//! operation itself: callers ask for admission with [`CircuitBreaker::try_acquire`]
//! and report the outcome with `record_success` / `record_failure`. Each
//! call returns the state transition it caused, if any, so the owner can
//! fire callbacks outside of its own lock.

use crate::{StorageBackend, callbacks::Transition, errors::CircuitError};
use serde::Serialize;
use state_machines::state_machine;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Cumulative failures (reset by any success) required to open the circuit
    pub failure_threshold: usize,

    /// Seconds since the last failure before an open circuit admits a probe
    pub reset_timeout_secs: f64,

    /// Number of probe successes required in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Probes admitted concurrently while HalfOpen
    pub half_open_max_probes: usize,

    /// Jitter factor for reset_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30.0,
            success_threshold: 1,
            half_open_max_probes: 1,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.reset_timeout_secs.max(0.0))
    }
}

/// Public state of a circuit, as reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    fn from_state_name(name: &str) -> Self {
        match name {
            "Open" => CircuitStatus::Open,
            "HalfOpen" => CircuitStatus::HalfOpen,
            _ => CircuitStatus::Closed,
        }
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitState {
    pub name: String,
    pub status: CircuitStatus,
    pub failure_count: usize,
    pub last_failure_at: Option<f64>,
    /// True while the circuit is not closed
    pub is_open: bool,
    pub consecutive_successes: usize,
    pub half_open_probes_used: usize,
}

/// Ties a probe to the half-open episode that admitted it
///
/// Outcomes reported with a ticket from an earlier episode, or with no
/// ticket at all, never drive HalfOpen transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    episode: u64,
}

/// Result of a successful admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// Set when the call is a half-open probe
    pub probe: Option<ProbeTicket>,
    /// Transition taken while deciding (Open -> HalfOpen)
    pub transition: Option<Transition>,
}

impl Admitted {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: Config::default(),
            storage: Arc::new(crate::MemoryStorage::new()),
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("storage", &"<dyn StorageBackend>")
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub probes_in_flight: usize,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Cumulative failures reached the threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.storage.failure_count(&ctx.name) >= ctx.config.failure_threshold
    }
}

impl Circuit<HalfOpen> {
    /// A failed probe always reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.consecutive_successes >= ctx.config.success_threshold)
    }
}

impl Circuit<Open> {
    /// Check if the reset timeout has elapsed since the last failure
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(last_failure_at) = ctx.storage.last_failure_at(&ctx.name) else {
            return true;
        };
        let elapsed = ctx.storage.monotonic_time() - last_failure_at;

        let timeout_secs = if ctx.config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: (ctx.config.reset_timeout_secs * 1000.0) as u64,
                multiplier: 1.0,
                max_delay_ms: (ctx.config.reset_timeout_secs * 1000.0) as u64,
            };
            let timeout_ms = policy.calculate_delay(1, ctx.config.jitter_factor);
            (timeout_ms as f64) / 1000.0
        } else {
            ctx.config.reset_timeout_secs
        };

        elapsed >= timeout_secs
    }
}

/// Circuit breaker for a single operation name
pub struct CircuitBreaker {
    machine: DynamicCircuit,
    context: CircuitContext,
    /// Bumped on every Open -> HalfOpen transition
    episode: u64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.machine.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker with its own in-memory storage
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::with_storage(name, config, Arc::new(crate::MemoryStorage::new()))
    }

    /// Create a circuit breaker on shared storage
    pub fn with_storage(
        name: impl Into<String>,
        config: Config,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let context = CircuitContext {
            name: name.into(),
            config,
            storage,
        };
        let machine = DynamicCircuit::new(context.clone());

        Self {
            machine,
            context,
            episode: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Decide whether a call may proceed
    ///
    /// An open circuit whose reset timeout has elapsed moves to HalfOpen
    /// here, and the caller becomes the probe.
    pub fn try_acquire(&mut self) -> Result<Admitted, CircuitError> {
        let mut transition = None;
        if self.machine.current_state() == "Open"
            && self.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            self.episode += 1;
            transition = Some(Transition::HalfOpened);
        }

        match self.machine.current_state() {
            "Open" => {
                let opened_at = self.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0);
                Err(CircuitError::Open {
                    circuit: self.context.name.clone(),
                    opened_at,
                })
            }
            "HalfOpen" => {
                let limit = self.context.config.half_open_max_probes.max(1);
                match self.machine.half_open_data_mut() {
                    Some(data) if data.probes_in_flight < limit => {
                        data.probes_in_flight += 1;
                        Ok(Admitted {
                            probe: Some(ProbeTicket {
                                episode: self.episode,
                            }),
                            transition,
                        })
                    }
                    _ => Err(CircuitError::HalfOpenLimitReached {
                        circuit: self.context.name.clone(),
                    }),
                }
            }
            _ => Ok(Admitted {
                probe: None,
                transition,
            }),
        }
    }

    /// The ticket belongs to the half-open episode in progress
    fn is_current_probe(&self, probe: Option<ProbeTicket>) -> bool {
        self.is_half_open() && probe.is_some_and(|ticket| ticket.episode == self.episode)
    }

    /// Record a successful operation and drive HalfOpen -> Closed transitions
    ///
    /// While HalfOpen only the current probe's outcome counts; late results
    /// of calls admitted earlier are logged to storage and nothing more.
    pub fn record_success(
        &mut self,
        duration: f64,
        probe: Option<ProbeTicket>,
    ) -> Option<Transition> {
        self.context
            .storage
            .record_success(&self.context.name, duration);

        if self.is_current_probe(probe) {
            if let Some(data) = self.machine.half_open_data_mut() {
                data.consecutive_successes += 1;
                data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
            }

            if self.machine.handle(CircuitEvent::Close).is_ok() {
                return Some(Transition::Closed);
            }
        }
        None
    }

    /// Record a failed operation and attempt to trip the circuit
    pub fn record_failure(
        &mut self,
        duration: f64,
        probe: Option<ProbeTicket>,
    ) -> Option<Transition> {
        self.context
            .storage
            .record_failure(&self.context.name, duration);

        if self.is_half_open() && !self.is_current_probe(probe) {
            return None;
        }
        if self.machine.handle(CircuitEvent::Trip).is_ok() {
            self.mark_open();
            return Some(Transition::Opened);
        }
        None
    }

    /// Free a probe slot without counting the outcome either way
    pub fn release_probe(&mut self, probe: ProbeTicket) {
        if !self.is_current_probe(Some(probe)) {
            return;
        }
        if let Some(data) = self.machine.half_open_data_mut() {
            data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn is_open(&self) -> bool {
        self.machine.current_state() == "Open"
    }

    pub fn is_half_open(&self) -> bool {
        self.machine.current_state() == "HalfOpen"
    }

    pub fn is_closed(&self) -> bool {
        self.machine.current_state() == "Closed"
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.current_state()
    }

    pub fn status(&self) -> CircuitStatus {
        CircuitStatus::from_state_name(self.machine.current_state())
    }

    pub fn snapshot(&self) -> CircuitState {
        let status = self.status();
        let (consecutive_successes, half_open_probes_used) = self
            .machine
            .half_open_data()
            .map_or((0, 0), |d| (d.consecutive_successes, d.probes_in_flight));

        CircuitState {
            name: self.context.name.clone(),
            status,
            failure_count: self.context.storage.failure_count(&self.context.name),
            last_failure_at: self.context.storage.last_failure_at(&self.context.name),
            is_open: status != CircuitStatus::Closed,
            consecutive_successes,
            half_open_probes_used,
        }
    }

    /// Clear all events and reset circuit to Closed state
    pub fn reset(&mut self) {
        self.context.storage.clear(&self.context.name);
        self.machine = DynamicCircuit::new(self.context.clone());
    }

    fn mark_open(&mut self) {
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = self.context.storage.monotonic_time();
        }
    }
}
