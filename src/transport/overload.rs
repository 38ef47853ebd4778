//! Server-advertised overload wait-time.
//!
//! The wait-time ratchets up while overloaded responses keep arriving inside
//! the current window and falls back to the initial value once a full
//! window passes without one.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::OverloadConfig;

#[derive(Debug)]
struct OverloadState {
    wait: Duration,
    counter: u32,
    last_overloaded: Option<Instant>,
}

#[derive(Debug)]
pub struct OverloadBackoff {
    initial: Duration,
    max: Duration,
    limit: u32,
    state: Mutex<OverloadState>,
}

impl OverloadBackoff {
    pub fn new(initial: Duration, max: Duration, limit: u32) -> Self {
        Self {
            initial,
            max,
            limit,
            state: Mutex::new(OverloadState {
                wait: initial,
                counter: 0,
                last_overloaded: None,
            }),
        }
    }

    pub fn from_config(config: &OverloadConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_wait_ms),
            Duration::from_millis(config.max_wait_ms),
            config.response_limit,
        )
    }

    /// Wait-time to advertise for one overloaded request.
    pub fn next_wait(&self) -> Duration {
        self.next_wait_at(Instant::now())
    }

    pub fn next_wait_millis(&self) -> u32 {
        u32::try_from(self.next_wait().as_millis()).unwrap_or(u32::MAX)
    }

    pub(crate) fn next_wait_at(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();

        let within_window = state
            .last_overloaded
            .map(|last| now.saturating_duration_since(last) < state.wait)
            .unwrap_or(false);

        if within_window {
            // The response that opened the window counts as the first one,
            // so reaching `limit` increments means `limit + 1` responses.
            state.counter += 1;
            if state.counter >= self.limit {
                state.wait = state.wait.saturating_mul(2).min(self.max);
                state.counter = 0;
                debug!(wait_ms = state.wait.as_millis() as u64, "Overload wait-time raised");
            }
        } else {
            state.counter = 0;
            state.wait = self.initial;
        }

        state.last_overloaded = Some(now);
        state.wait
    }

    /// Currently advertised wait-time, without recording a response.
    pub fn current_wait(&self) -> Duration {
        self.state.lock().wait
    }
}
