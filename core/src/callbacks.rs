//! Callback system for circuit breaker state transitions

use std::sync::Arc;

/// A state change reported by a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Callbacks for circuit breaker events
#[derive(Clone)]
pub struct Callbacks {
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_open: None,
            on_close: None,
            on_half_open: None,
        }
    }

    /// Log a transition and invoke the matching callback
    pub fn dispatch(&self, circuit: &str, transition: Transition) {
        match transition {
            Transition::Opened => {
                tracing::warn!(circuit, "circuit opened");
                self.trigger_open(circuit);
            }
            Transition::HalfOpened => {
                tracing::info!(circuit, "circuit half-open, admitting probe");
                self.trigger_half_open(circuit);
            }
            Transition::Closed => {
                tracing::info!(circuit, "circuit closed");
                self.trigger_close(circuit);
            }
        }
    }

    pub fn trigger_open(&self, circuit: &str) {
        if let Some(ref callback) = self.on_open {
            callback(circuit);
        }
    }

    pub fn trigger_close(&self, circuit: &str) {
        if let Some(ref callback) = self.on_close {
            callback(circuit);
        }
    }

    pub fn trigger_half_open(&self, circuit: &str) {
        if let Some(ref callback) = self.on_half_open {
            callback(circuit);
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_routes_to_matching_callback() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let mut callbacks = Callbacks::new();
        let o = opened.clone();
        callbacks.on_open = Some(Arc::new(move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        }));
        let c = closed.clone();
        callbacks.on_close = Some(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        callbacks.dispatch("x", Transition::Opened);
        callbacks.dispatch("x", Transition::HalfOpened);
        callbacks.dispatch("x", Transition::Closed);
        callbacks.dispatch("x", Transition::Opened);

        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
