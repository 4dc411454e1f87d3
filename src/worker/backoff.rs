//! Exponential backoff helpers shared by the poll loop and provider retries

use std::time::Duration;

/// `base * 2^(attempt - 1)`, capped at `max`. `attempt` is 1-based.
pub fn exponential_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Idle delay for the claim loop: doubles on every consecutive empty claim and
/// resets as soon as a claim returns work.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    empty_polls: u32,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            empty_polls: 0,
        }
    }

    /// Record an empty (or failed) claim and return how long to sleep
    pub fn next_idle_delay(&mut self) -> Duration {
        self.empty_polls = self.empty_polls.saturating_add(1);
        exponential_delay(self.base, self.max, self.empty_polls)
    }

    /// Record a claim that returned at least one task
    pub fn reset(&mut self) {
        self.empty_polls = 0;
    }

    /// Delay the next empty poll would produce, without recording it
    pub fn current(&self) -> Duration {
        exponential_delay(self.base, self.max, self.empty_polls.saturating_add(1))
    }
}
