//! Speculative execution.
//!
//! For idempotent requests a profile may allow launching additional attempts
//! on further plan hosts before the first attempt has answered; the first
//! decisive response wins.

use std::fmt;
use std::time::Duration;

pub trait SpeculativeExecutionPolicy: Send + Sync + fmt::Debug {
    /// How many speculative attempts may run on top of the initial one.
    fn max_retry_count(&self) -> usize;

    /// Delay before launching attempt number `attempt` (1-based).
    fn retry_interval(&self, attempt: usize) -> Duration;
}

/// A fixed number of speculative attempts with a constant delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_retry_count: usize,
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self, _attempt: usize) -> Duration {
        self.retry_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_policy_is_constant() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 2,
            retry_interval: Duration::from_millis(10),
        };
        assert_eq!(policy.max_retry_count(), 2);
        assert_eq!(policy.retry_interval(1), policy.retry_interval(2));
    }
}
