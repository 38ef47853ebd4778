//! Client-side retry pacing.
//!
//! A [`TimeoutStrategy`] is consulted by the receive loop before every
//! blocking receive. It is told when a receive timed out and when a message
//! arrived, and recomputes the next deadline accordingly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub trait TimeoutStrategy: Send {
    /// Current timeout to apply to the next receive.
    fn timeout(&self) -> Duration;

    /// A receive elapsed without data.
    fn on_timed_out(&mut self);

    /// Return to the initial timeout.
    fn reset(&mut self);
}

/// Timeout state shared between a receive loop and whoever drives retries.
pub type SharedTimeout = Arc<Mutex<dyn TimeoutStrategy>>;

/// Doubles on every timeout, back to `initial` on reset.
#[derive(Debug, Clone)]
pub struct ExponentialTimeout {
    initial: Duration,
    current: Duration,
    max: Option<Duration>,
}

impl ExponentialTimeout {
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max: None,
        }
    }

    /// Stop doubling once `max` is reached.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub fn shared(self) -> SharedTimeout {
        Arc::new(Mutex::new(self))
    }
}

impl TimeoutStrategy for ExponentialTimeout {
    fn timeout(&self) -> Duration {
        self.current
    }

    fn on_timed_out(&mut self) {
        let doubled = self.current.saturating_mul(2);
        self.current = match self.max {
            Some(max) => doubled.min(max),
            None => doubled,
        };
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Constant poll interval. Servers use it so the receive loop wakes up
/// regularly and observes its stop flag.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeout(pub Duration);

impl FixedTimeout {
    pub fn shared(self) -> SharedTimeout {
        Arc::new(Mutex::new(self))
    }
}

impl TimeoutStrategy for FixedTimeout {
    fn timeout(&self) -> Duration {
        self.0
    }

    fn on_timed_out(&mut self) {}

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_timeout() {
        let initial = Duration::from_millis(100);
        let mut timeout = ExponentialTimeout::new(initial);

        for n in 0..6u32 {
            assert_eq!(timeout.timeout(), initial * 2u32.pow(n));
            timeout.on_timed_out();
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let initial = Duration::from_millis(250);
        let mut timeout = ExponentialTimeout::new(initial);
        for _ in 0..10 {
            timeout.on_timed_out();
        }
        assert!(timeout.timeout() > initial);

        timeout.reset();
        assert_eq!(timeout.timeout(), initial);

        // A fresh strategy resets to the same value too
        let mut fresh = ExponentialTimeout::new(initial);
        fresh.reset();
        assert_eq!(fresh.timeout(), initial);
    }

    #[test]
    fn test_max_caps_growth() {
        let mut timeout = ExponentialTimeout::new(Duration::from_millis(100))
            .with_max(Duration::from_millis(350));
        timeout.on_timed_out();
        timeout.on_timed_out();
        timeout.on_timed_out();
        assert_eq!(timeout.timeout(), Duration::from_millis(350));
    }

    #[test]
    fn test_shared_timeout_is_observed_by_all_holders() {
        let shared = ExponentialTimeout::new(Duration::from_millis(10)).shared();
        let other = shared.clone();
        shared.lock().on_timed_out();
        assert_eq!(other.lock().timeout(), Duration::from_millis(20));
        other.lock().reset();
        assert_eq!(shared.lock().timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_fixed_timeout_never_changes() {
        let mut fixed = FixedTimeout(Duration::from_millis(500));
        fixed.on_timed_out();
        fixed.on_timed_out();
        assert_eq!(fixed.timeout(), Duration::from_millis(500));
    }
}
