//! Creation circuit breaker (§4.3, §9): creation is the only tick operation
//! that can cascade, since each failed create burns time and provider
//! quota. Other paths don't need one.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Tripped until the given instant; creation attempts are suppressed.
    Open { until: DateTime<Utc> },
}

pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
    cool_down: chrono::Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cool_down: chrono::Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold,
            cool_down,
        }
    }

    /// Whether a creation attempt should proceed right now.
    pub fn allow_create(&mut self) -> bool {
        if let BreakerState::Open { until } = self.state
            && Utc::now() >= until
        {
            self.state = BreakerState::Closed;
            self.consecutive_failures = 0;
        }
        matches!(self.state, BreakerState::Closed)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    /// Record a failed create. Returns `true` if this call tripped the
    /// breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && self.state == BreakerState::Closed {
            self.state = BreakerState::Open {
                until: Utc::now() + self.cool_down,
            };
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }
}
