use std::time::Duration;

/// Outcome of asking the backoff policy for the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry after `delay`. `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent.
    Exhausted,
}

/// Capped exponential backoff with an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before 1-based `attempt`: `base * 2^(attempt - 1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// Decide on attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        if attempt > self.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        ReconnectDecision::Retry {
            attempt,
            delay: self.delay_for_attempt(attempt),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_delay() {
        let policy = BackoffPolicy::new(250, 8_000, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
    }

    #[test]
    fn doubles_per_attempt_and_caps() {
        let policy = BackoffPolicy::new(100, 1_000, 10);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(1_000));
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let policy = BackoffPolicy::new(u64::MAX / 2, u64::MAX, 3);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn exhausts_after_budget() {
        let policy = BackoffPolicy::new(10, 100, 2);
        assert!(matches!(
            policy.decide(2),
            ReconnectDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(policy.decide(3), ReconnectDecision::Exhausted);
    }

    #[test]
    fn max_delay_never_below_base() {
        let policy = BackoffPolicy::new(5_000, 10, 1);
        assert_eq!(policy.max_delay_ms(), 5_000);
    }
}
