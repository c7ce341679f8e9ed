//! Reconnection controller for long-lived listen sessions.
//!
//! DESIGN
//! ======
//! A pure state machine: callers drive it with connection lifecycle events
//! and it answers with how long to wait before the next attempt. Backoff is
//! exponential with a hard cap, and every delay is jittered so a fleet of
//! clients recovering from the same outage does not reconnect in lockstep.
//! A successful authentication resets the attempt counter; a deliberate
//! close (or an authentication rejection) parks the controller for good.

use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const BACKOFF_FACTOR: u32 = 2;

/// Lower bound of the jitter multiplier; delays land in [half, full].
const JITTER_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Terminal: a deliberate close or rejected credentials. No retries.
    Closed,
}

pub struct ReconnectController {
    state: ConnState,
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ReconnectController {
    #[must_use]
    pub fn new() -> Self {
        Self::with_delays(
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }

    /// Controller with explicit delay bounds (tests use short ones).
    #[must_use]
    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Self {
        Self { state: ConnState::Disconnected, attempts: 0, base_delay, max_delay }
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn on_connecting(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Connecting;
        }
    }

    pub fn on_authenticating(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Authenticating;
        }
    }

    /// Successful authentication: the session is live, backoff starts over.
    pub fn on_connected(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Connected;
            self.attempts = 0;
        }
    }

    /// The connection dropped. Returns the jittered delay before the next
    /// attempt, or `None` once the controller is closed.
    pub fn on_connection_lost(&mut self) -> Option<Duration> {
        if self.state == ConnState::Closed {
            return None;
        }
        self.state = ConnState::Disconnected;
        let delay = self.next_delay();
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Deliberate shutdown or rejected credentials; retrying cannot help.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    fn next_delay(&self) -> Duration {
        jitter(self.raw_delay())
    }

    /// Uncapped-then-capped exponential delay for the current attempt count.
    fn raw_delay(&self) -> Duration {
        let factor = BACKOFF_FACTOR.checked_pow(self.attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new()
    }
}

fn jitter(delay: Duration) -> Duration {
    let multiplier = rand::rng().random_range(JITTER_FLOOR..=1.0);
    delay.mul_f64(multiplier)
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
