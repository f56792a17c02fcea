//! Failure classification
//!
//! Decides which dispatch failures count toward opening a circuit. A
//! classifier can, for example, ignore timeouts of an operation whose
//! backend is known to be slow but healthy.

use crate::errors::DispatchError;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit (operation) name
    pub circuit_name: &'a str,
    /// The error the operation settled with
    pub error: &'a DispatchError,
    /// Duration of the whole operation in seconds, retries included
    pub duration: f64,
}

/// Trait for classifying failures - determines if an error should trip the circuit
///
/// # Examples
///
/// ```rust
/// use relay_machines::{DispatchError, FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct IgnoreTimeouts;
///
/// impl FailureClassifier for IgnoreTimeouts {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         !matches!(ctx.error, DispatchError::OperationTimeout { .. })
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should count toward opening the circuit
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that trips on all errors
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> DispatchError {
        DispatchError::OperationTimeout {
            name: "search".to_string(),
            timeout_ms: 100,
        }
    }

    fn failed() -> DispatchError {
        DispatchError::OperationFailed {
            name: "search".to_string(),
            last_error: "503".to_string(),
            attempts: 3,
        }
    }

    #[test]
    fn test_default_classifier_trips_all() {
        let err = timeout();
        let ctx = FailureContext {
            circuit_name: "search",
            error: &err,
            duration: 0.1,
        };
        assert!(DefaultClassifier.should_trip(&ctx));
    }

    #[test]
    fn test_predicate_classifier_filters_by_variant() {
        let classifier = PredicateClassifier::new(|ctx| !ctx.error.is_timeout());

        let t = timeout();
        let f = failed();
        let timeout_ctx = FailureContext {
            circuit_name: "search",
            error: &t,
            duration: 0.1,
        };
        let failed_ctx = FailureContext {
            circuit_name: "search",
            error: &f,
            duration: 0.1,
        };

        assert!(!classifier.should_trip(&timeout_ctx));
        assert!(classifier.should_trip(&failed_ctx));
    }

    #[test]
    fn test_predicate_classifier_on_duration() {
        let classifier = PredicateClassifier::new(|ctx| ctx.duration > 1.0);
        let err = failed();

        let fast = FailureContext {
            circuit_name: "search",
            error: &err,
            duration: 0.5,
        };
        let slow = FailureContext {
            circuit_name: "search",
            error: &err,
            duration: 2.0,
        };

        assert!(!classifier.should_trip(&fast));
        assert!(classifier.should_trip(&slow));
    }
}
