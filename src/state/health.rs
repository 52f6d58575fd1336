//! Primary Grace-Period Tracking
//!
//! Remembers when each primary first failed a health check so a primary
//! is only declared unhealthy after failing continuously for the grace
//! period.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Where a primary stands in the grace-period state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrimaryHealth {
    Healthy,
    /// Failing, still inside the grace period
    ProvisionallyUnhealthy,
    /// Failing for at least the grace period
    ConfirmedUnhealthy,
}

impl PrimaryHealth {
    /// Whether the primary should still be treated as healthy
    pub fn is_healthy(&self) -> bool {
        !matches!(self, PrimaryHealth::ConfirmedUnhealthy)
    }
}

impl std::fmt::Display for PrimaryHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimaryHealth::Healthy => write!(f, "HEALTHY"),
            PrimaryHealth::ProvisionallyUnhealthy => write!(f, "PROVISIONALLY_UNHEALTHY"),
            PrimaryHealth::ConfirmedUnhealthy => write!(f, "CONFIRMED_UNHEALTHY"),
        }
    }
}

/// Per-endpoint first-failure timestamps
pub struct NodeHealthStore {
    first_failures: DashMap<String, DateTime<Utc>>,
    grace_period: Duration,
}

impl NodeHealthStore {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            first_failures: DashMap::new(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Feed the result of a simple health check for a primary
    pub fn observe_primary(&self, endpoint: &str, check_passed: bool, now: DateTime<Utc>) -> PrimaryHealth {
        if check_passed {
            self.first_failures.remove(endpoint);
            return PrimaryHealth::Healthy;
        }

        let first_failure = *self
            .first_failures
            .entry(endpoint.to_string())
            .or_insert(now);

        let failing_for = (now - first_failure).to_std().unwrap_or(Duration::ZERO);
        if failing_for >= self.grace_period {
            PrimaryHealth::ConfirmedUnhealthy
        } else {
            PrimaryHealth::ProvisionallyUnhealthy
        }
    }

    pub fn first_failure(&self, endpoint: &str) -> Option<DateTime<Utc>> {
        self.first_failures.get(endpoint).map(|entry| *entry)
    }

    /// All tracked endpoints with their first failure time
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut entries: Vec<_> = self
            .first_failures
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_grace_period_state_machine() {
        let store = NodeHealthStore::new(Duration::from_secs(24 * 3600));
        let t0 = Utc::now();

        assert_eq!(
            store.observe_primary("http://cn1", false, t0),
            PrimaryHealth::ProvisionallyUnhealthy
        );
        assert_eq!(store.first_failure("http://cn1"), Some(t0));

        // Later failures keep the original timestamp
        let t1 = t0 + ChronoDuration::hours(23);
        assert_eq!(
            store.observe_primary("http://cn1", false, t1),
            PrimaryHealth::ProvisionallyUnhealthy
        );
        assert_eq!(store.first_failure("http://cn1"), Some(t0));

        let t2 = t0 + ChronoDuration::hours(24);
        assert_eq!(
            store.observe_primary("http://cn1", false, t2),
            PrimaryHealth::ConfirmedUnhealthy
        );
        assert!(!PrimaryHealth::ConfirmedUnhealthy.is_healthy());
    }

    #[test]
    fn test_recovery_resets_timer() {
        let store = NodeHealthStore::new(Duration::from_secs(24 * 3600));
        let t0 = Utc::now();

        store.observe_primary("http://cn1", false, t0);
        assert_eq!(
            store.observe_primary("http://cn1", true, t0 + ChronoDuration::hours(12)),
            PrimaryHealth::Healthy
        );
        assert!(store.first_failure("http://cn1").is_none());

        // A fresh failure starts a new grace period
        let t1 = t0 + ChronoDuration::hours(30);
        assert_eq!(
            store.observe_primary("http://cn1", false, t1),
            PrimaryHealth::ProvisionallyUnhealthy
        );
        assert_eq!(store.snapshot(), vec![("http://cn1".to_string(), t1)]);
    }
}
