//! Reconnect pacing.
//!
//! When a pool loses a connection (or a connector fails non-critically) the
//! next attempt is delayed by the pool's reconnection schedule. A schedule
//! is restarted from the policy whenever a reconnect succeeds.

use std::fmt;
use std::time::Duration;

pub trait ReconnectionPolicy: Send + Sync + fmt::Debug {
    /// Starts a fresh delay schedule. The iterator is infinite.
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// The same delay before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(std::iter::repeat(self.delay))
    }
}

/// Doubling delays between a base and a cap.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(10))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(ExponentialSchedule {
            next_delay: self.base_delay,
            max_delay: self.max_delay,
        })
    }
}

struct ExponentialSchedule {
    next_delay: Duration,
    max_delay: Duration,
}

impl Iterator for ExponentialSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next_delay;
        self.next_delay = std::cmp::min(self.max_delay, self.next_delay * 2);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_up_to_the_cap() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = policy.new_schedule().take(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn schedules_are_independent() {
        let policy = ExponentialReconnectionPolicy::default();
        let mut first = policy.new_schedule();
        first.next();
        first.next();
        let mut second = policy.new_schedule();
        assert_eq!(second.next(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_secs(2));
        let delays: Vec<_> = policy.new_schedule().take(3).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_secs(2)));
    }
}
