//! Error types for dispatch, circuit admission and routing

use thiserror::Error;

/// Boxed error accepted from user-supplied operations and fallbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reasons a circuit refuses to admit a call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitError {
    /// Circuit is open, calls are being rejected
    #[error("Circuit '{circuit}' is open (opened at {opened_at})")]
    Open { circuit: String, opened_at: f64 },
    /// The half-open probe slot is already taken
    #[error("Circuit '{circuit}' half-open request limit reached")]
    HalfOpenLimitReached { circuit: String },
}

impl CircuitError {
    /// Name of the circuit that rejected the call
    pub fn circuit(&self) -> &str {
        match self {
            CircuitError::Open { circuit, .. } | CircuitError::HalfOpenLimitReached { circuit } => {
                circuit
            }
        }
    }
}

/// Errors surfaced by the dispatcher and the strategy router
///
/// Operation errors are carried as display strings so results stay `Clone`
/// and can be fanned out to several observers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// A single attempt exceeded its deadline
    #[error("Operation '{name}' timed out after {timeout_ms}ms")]
    OperationTimeout { name: String, timeout_ms: u64 },

    /// Every attempt failed
    #[error("Operation '{name}' failed after {attempts} attempt(s): {last_error}")]
    OperationFailed {
        name: String,
        last_error: String,
        attempts: u32,
    },

    /// The operation was never invoked because its circuit is open
    #[error("Circuit for operation '{name}' is open")]
    CircuitOpen { name: String },

    /// All attempts failed and the fallback failed as well
    #[error("Fallback for operation '{name}' failed: {fallback_error}")]
    FallbackFailed { name: String, fallback_error: String },

    /// The selected strategy and its single alternate both failed
    #[error("All strategies failed (primary: {primary}; fallback: {fallback})")]
    AllStrategiesFailed {
        primary: Box<DispatchError>,
        fallback: Box<DispatchError>,
    },

    /// Caller-side batch check: required operations did not produce a value
    #[error("Required operation(s) missing: {}", names.join(", "))]
    RequiredOperationMissing { names: Vec<String> },
}

impl DispatchError {
    /// Operation name the error refers to, when it refers to a single one
    pub fn operation(&self) -> Option<&str> {
        match self {
            DispatchError::OperationTimeout { name, .. }
            | DispatchError::OperationFailed { name, .. }
            | DispatchError::CircuitOpen { name }
            | DispatchError::FallbackFailed { name, .. } => Some(name),
            DispatchError::AllStrategiesFailed { .. }
            | DispatchError::RequiredOperationMissing { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::OperationTimeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DispatchError::CircuitOpen { .. })
    }
}

impl From<CircuitError> for DispatchError {
    fn from(err: CircuitError) -> Self {
        DispatchError::CircuitOpen {
            name: err.circuit().to_string(),
        }
    }
}
