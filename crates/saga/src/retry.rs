//! Retry classification and backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::step::{Outcome, OutcomeKind};

/// Decides whether a failed attempt is retried and how long to wait first.
///
/// Backoff grows as `base_backoff * 2^(attempt - 1)`, receives up to `jitter`
/// of random extra delay, and never exceeds `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
    /// Outcome tags that may be retried.
    ///
    /// Success and PermanentFailure are never retried, whatever this lists.
    pub retryable: Vec<OutcomeKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(50),
            retryable: vec![OutcomeKind::TransientFailure],
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and default timings.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
            retryable: vec![OutcomeKind::TransientFailure],
        }
    }

    /// A policy that retries immediately, without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stops retrying transient failures while keeping the attempt budget.
    pub fn without_transient_retries(mut self) -> Self {
        self.retryable.retain(|k| *k != OutcomeKind::TransientFailure);
        self
    }

    /// Returns true if `outcome`, produced by attempt number `attempt`
    /// (1-based), should be attempted again.
    pub fn should_retry(&self, outcome: &Outcome, attempt: u32) -> bool {
        match outcome.kind() {
            OutcomeKind::Success | OutcomeKind::PermanentFailure => false,
            kind => self.retryable.contains(&kind) && attempt < self.max_attempts,
        }
    }

    /// Exponential delay before the attempt after `attempt`, without jitter.
    pub fn base_backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before the attempt after `attempt`, with jitter from `rng`.
    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_backoff_for(attempt);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        base.saturating_add(extra).min(self.max_backoff)
    }

    /// Delay before the attempt after `attempt`, with thread-local jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    /// Reclassifies a transient failure that will not be retried as permanent.
    pub fn finalize(&self, outcome: Outcome, attempts: u32) -> Outcome {
        match outcome {
            Outcome::TransientFailure(reason) => Outcome::PermanentFailure(format!(
                "gave up after {attempts} attempt(s): {reason}"
            )),
            other => other,
        }
    }
}
