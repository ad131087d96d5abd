//! Cooperative stop signals for worker threads.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A shared flag a supervisor raises to ask a worker to stop.
///
/// Clones observe the same flag. Workers poll [`StopSignal::is_raised`] at
/// every blocking boundary; nothing is interrupted forcibly.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A fresh, lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_default_lowered() {
        assert!(!StopSignal::new().is_raised());
    }

    #[test]
    fn test_clones_share_flag() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        signal.raise();
        assert!(observer.is_raised());
    }
}
