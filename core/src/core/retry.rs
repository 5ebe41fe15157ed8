//! Retry decisions for the solve loop.
//!
//! Pure logic, no clocks and no sleeping: the orchestrator feeds in the last
//! attempt outcome plus its counters and acts on the returned `Decision`.
//!
//! Detected and attempt timeouts retry immediately on a fresh proxy. Try-again
//! and infra errors back off: fixed, or 1s → 2s → 4s → ... up to the cap.

use std::time::Duration;

use crate::core::AttemptResult;

const MAX_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { after: Duration },
    StopSuccess,
    StopExhausted,
    StopTimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, max_attempts: None }
    }

    /// Stops with `StopExhausted` once this many attempts have run.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.filter(|&n| n > 0);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn decide(
        &self,
        outcome: &AttemptResult,
        attempts_so_far: u32,
        elapsed: Duration,
        deadline: Duration,
    ) -> Decision {
        if elapsed >= deadline {
            return Decision::StopTimedOut;
        }
        if outcome.is_success() {
            return Decision::StopSuccess;
        }
        if let Some(cap) = self.max_attempts {
            if attempts_so_far >= cap {
                return Decision::StopExhausted;
            }
        }

        match outcome {
            AttemptResult::Detected | AttemptResult::TimedOut => Decision::Retry { after: Duration::ZERO },
            AttemptResult::TryAgain | AttemptResult::InfraError { .. } => Decision::Retry {
                after: self.backoff_for(attempts_so_far),
            },
            AttemptResult::Success { .. } => Decision::StopSuccess,
        }
    }

    /// Delay before the attempt following attempt number `attempts_so_far`.
    pub fn backoff_for(&self, attempts_so_far: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let doublings = attempts_so_far.saturating_sub(1).min(MAX_DOUBLINGS);
                initial.saturating_mul(1u32 << doublings).min(max)
            }
        }
    }
}
