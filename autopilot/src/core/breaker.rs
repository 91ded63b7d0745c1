//! Circuit breaker state machine.
//!
//! Time is passed in by the caller, so every transition is deterministic.
//! Transitions happen only through [`CircuitBreaker::try_acquire`],
//! [`CircuitBreaker::record_success`] and [`CircuitBreaker::record_failure`].

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call.
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    failure_threshold: u32,
    reset_timeout: Duration,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Ask to run one call. An open breaker whose reset timeout has elapsed
    /// moves to half-open and admits exactly one trial.
    pub fn try_acquire(&mut self, now: Instant) -> (Admission, Option<BreakerTransition>) {
        match self.state {
            BreakerState::Closed => (Admission::Allowed, None),
            BreakerState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    self.trial_in_flight = true;
                    let transition = self.move_to(BreakerState::HalfOpen);
                    (Admission::Trial, transition)
                } else {
                    (
                        Admission::Rejected {
                            retry_in: self.reset_timeout - elapsed,
                        },
                        None,
                    )
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    (
                        Admission::Rejected {
                            retry_in: Duration::ZERO,
                        },
                        None,
                    )
                } else {
                    self.trial_in_flight = true;
                    (Admission::Trial, None)
                }
            }
        }
    }

    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        self.failure_count = 0;
        self.trial_in_flight = false;
        self.move_to(BreakerState::Closed)
    }

    /// Give back a trial slot without recording an outcome.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<BreakerTransition> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        self.trial_in_flight = false;
        match self.state {
            BreakerState::HalfOpen => self.move_to(BreakerState::Open),
            BreakerState::Closed if self.failure_count >= self.failure_threshold => {
                self.move_to(BreakerState::Open)
            }
            _ => None,
        }
    }

    fn move_to(&mut self, to: BreakerState) -> Option<BreakerTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(BreakerTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET: Duration = Duration::from_secs(60);

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let now = Instant::now();
        assert!(breaker.record_failure(now).is_none());
        assert!(breaker.record_failure(now).is_none());
        let opened = breaker.record_failure(now).expect("transition");
        assert_eq!(opened.to, BreakerState::Open);

        let (admission, _) = breaker.try_acquire(now + Duration::from_secs(10));
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_in: Duration::from_secs(50)
            }
        );
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let mut breaker = CircuitBreaker::new(1, RESET);
        let start = Instant::now();
        breaker.record_failure(start);

        let later = start + RESET;
        let (first, transition) = breaker.try_acquire(later);
        assert_eq!(first, Admission::Trial);
        assert_eq!(transition.map(|t| t.to), Some(BreakerState::HalfOpen));

        let (second, _) = breaker.try_acquire(later);
        assert!(matches!(second, Admission::Rejected { .. }));
    }

    #[test]
    fn successful_trial_closes_and_zeroes_count() {
        let mut breaker = CircuitBreaker::new(2, RESET);
        let start = Instant::now();
        breaker.record_failure(start);
        breaker.record_failure(start);
        breaker.try_acquire(start + RESET);

        let closed = breaker.record_success().expect("transition");
        assert_eq!(closed.from, BreakerState::HalfOpen);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.try_acquire(start + RESET).0, Admission::Allowed);
    }

    #[test]
    fn failed_trial_reopens() {
        let mut breaker = CircuitBreaker::new(1, RESET);
        let start = Instant::now();
        breaker.record_failure(start);
        breaker.try_acquire(start + RESET);

        let trial_failed_at = start + RESET + Duration::from_secs(1);
        let reopened = breaker.record_failure(trial_failed_at).expect("transition");
        assert_eq!(reopened.to, BreakerState::Open);
        assert!(matches!(
            breaker.try_acquire(trial_failed_at).0,
            Admission::Rejected { .. }
        ));
    }

    #[test]
    fn released_trial_can_be_taken_again() {
        let mut breaker = CircuitBreaker::new(1, RESET);
        let start = Instant::now();
        breaker.record_failure(start);
        assert_eq!(breaker.try_acquire(start + RESET).0, Admission::Trial);

        breaker.release_trial();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.try_acquire(start + RESET).0, Admission::Trial);
    }

    #[test]
    fn success_in_closed_state_resets_count() {
        let mut breaker = CircuitBreaker::new(3, RESET);
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(breaker.record_success().is_none());
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
