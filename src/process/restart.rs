use crate::config::{AppSpec, RestartSettings};
use std::time::Duration;

/// Outcome of evaluating an exit against the restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    GiveUp,
}

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    pub settings: RestartSettings,
}

impl RestartPolicy {
    pub fn new(enabled: bool, settings: RestartSettings) -> Self {
        Self { enabled, settings }
    }

    /// Create a restart policy from an app spec
    pub fn from_spec(spec: &AppSpec) -> Self {
        Self::new(spec.autorestart, spec.restart.clone())
    }

    /// Decide what to do after the `failures`-th consecutive failure
    pub fn decide(&self, failures: u32) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::GiveUp;
        }

        if failures > self.settings.max_restarts {
            return RestartDecision::GiveUp;
        }

        if failures <= self.settings.backoff_threshold {
            return RestartDecision::RestartNow;
        }

        let attempt = failures - self.settings.backoff_threshold - 1;
        RestartDecision::RestartAfter(self.backoff_delay(attempt))
    }

    /// Exponential backoff: base * 2^attempt, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.backoff_cap)
    }
}

/// Tracks the failure streak of one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    consecutive_failures: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an unexpected exit after a run of `uptime` and return the streak length
    ///
    /// A run that lasted at least `min_uptime` counts as stable, so the streak
    /// restarts from this failure.
    pub fn record_exit(&mut self, uptime: Duration, min_uptime: Duration) -> u32 {
        if uptime >= min_uptime {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Forget the streak (explicit start/restart)
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_restarts: u32, threshold: u32) -> RestartSettings {
        RestartSettings {
            max_restarts,
            min_uptime: Duration::from_millis(1000),
            backoff_threshold: threshold,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_disabled_policy_gives_up() {
        let policy = RestartPolicy::new(false, settings(10, 3));
        assert_eq!(policy.decide(1), RestartDecision::GiveUp);
    }

    #[test]
    fn test_restart_now_below_threshold() {
        let policy = RestartPolicy::new(true, settings(10, 3));
        assert_eq!(policy.decide(1), RestartDecision::RestartNow);
        assert_eq!(policy.decide(2), RestartDecision::RestartNow);
        assert_eq!(policy.decide(3), RestartDecision::RestartNow);
    }

    #[test]
    fn test_backoff_escalates_after_threshold() {
        let policy = RestartPolicy::new(true, settings(10, 3));
        assert_eq!(
            policy.decide(4),
            RestartDecision::RestartAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(5),
            RestartDecision::RestartAfter(Duration::from_millis(200))
        );
        assert_eq!(
            policy.decide(6),
            RestartDecision::RestartAfter(Duration::from_millis(400))
        );
        // capped
        assert_eq!(
            policy.decide(9),
            RestartDecision::RestartAfter(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_gives_up_past_max_restarts() {
        let policy = RestartPolicy::new(true, settings(5, 3));
        assert_ne!(policy.decide(5), RestartDecision::GiveUp);
        assert_eq!(policy.decide(6), RestartDecision::GiveUp);
    }

    #[test]
    fn test_zero_threshold_backs_off_immediately() {
        let policy = RestartPolicy::new(true, settings(5, 0));
        assert_eq!(
            policy.decide(1),
            RestartDecision::RestartAfter(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_backoff_delay_saturates() {
        let policy = RestartPolicy::new(true, settings(100, 0));
        assert_eq!(policy.backoff_delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_policy_from_spec() {
        let mut spec = AppSpec::new("api", "/bin/sh");
        spec.autorestart = false;
        spec.restart.max_restarts = 4;

        let policy = RestartPolicy::from_spec(&spec);
        assert!(!policy.enabled);
        assert_eq!(policy.settings.max_restarts, 4);
    }

    #[test]
    fn test_tracker_counts_fast_failures() {
        let mut tracker = RestartTracker::new();
        let min_uptime = Duration::from_secs(1);

        assert_eq!(tracker.record_exit(Duration::from_millis(10), min_uptime), 1);
        assert_eq!(tracker.record_exit(Duration::from_millis(10), min_uptime), 2);
        assert_eq!(tracker.record_exit(Duration::from_millis(10), min_uptime), 3);
    }

    #[test]
    fn test_tracker_stable_run_resets_streak() {
        let mut tracker = RestartTracker::new();
        let min_uptime = Duration::from_secs(1);

        tracker.record_exit(Duration::from_millis(10), min_uptime);
        tracker.record_exit(Duration::from_millis(10), min_uptime);
        assert_eq!(tracker.record_exit(Duration::from_secs(5), min_uptime), 1);
    }

    #[test]
    fn test_tracker_reset() {
        let mut tracker = RestartTracker::new();
        tracker.record_exit(Duration::ZERO, Duration::from_secs(1));
        tracker.record_exit(Duration::ZERO, Duration::from_secs(1));
        tracker.reset();
        assert_eq!(tracker.record_exit(Duration::ZERO, Duration::from_secs(1)), 1);
    }
}
