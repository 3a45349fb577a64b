//! Execution profiles: named bundles of per-request policies.
//!
//! Every request runs under a profile — the session default, or a named one
//! selected via `Request::with_execution_profile`. A profile without its
//! own load-balancing policy inherits the default profile's.

use std::sync::Arc;
use std::time::Duration;

use crate::frame::Consistency;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;

#[derive(Clone)]
pub struct ExecutionProfile {
    /// `None` inherits the session default profile's policy.
    pub load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Speculative flights are only raced for idempotent requests.
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub consistency: Consistency,
    /// `None` disables the client-side request timeout.
    pub request_timeout: Option<Duration>,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            load_balancing_policy: None,
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            consistency: Consistency::default(),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_has_a_retry_policy_and_timeout() {
        let profile = ExecutionProfile::default();
        assert!(profile.load_balancing_policy.is_none());
        assert!(profile.speculative_execution_policy.is_none());
        assert_eq!(profile.consistency, Consistency::ONE);
        assert_eq!(profile.request_timeout, Some(Duration::from_secs(30)));
    }
}
