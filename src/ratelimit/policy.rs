//! Turning window state into a caller-facing decision.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::tracker::WindowState;

/// The outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Trials allowed per window
    pub limit: i64,
    /// Trials left in this window; negative once the limit is exceeded
    pub remaining: i64,
    /// Milliseconds until the window closes, after any throttle wait
    pub reset_ms: u64,
    /// Whether the limiter throttles instead of rejecting
    pub uses_delay: bool,
}

impl Decision {
    /// Time until the window closes.
    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }

    /// Whether the caller may proceed.
    ///
    /// Throttling limiters always let the caller through once the wait is over.
    pub fn is_allowed(&self) -> bool {
        self.remaining >= 0 || self.uses_delay
    }
}

/// Rounds up so a live window never reports zero.
fn ceil_millis(d: Duration) -> u64 {
    let millis = d.as_millis() as u64;
    if d.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Applies a limit and an optional per-excess-trial throttle delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    limit: i64,
    delay: Duration,
}

impl DecisionPolicy {
    /// Create a policy. A zero `delay` rejects outright at the limit.
    pub fn new(limit: i64, delay: Duration) -> Self {
        Self { limit, delay }
    }

    /// The configured limit.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// The configured delay per excess trial.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether throttling is enabled.
    pub fn uses_delay(&self) -> bool {
        !self.delay.is_zero()
    }

    /// How long a caller that is `remaining` trials into the window must wait.
    pub fn wait_for(&self, remaining: i64) -> Duration {
        if !self.uses_delay() || remaining >= 0 {
            return Duration::ZERO;
        }
        let excess = u32::try_from(remaining.unsigned_abs()).unwrap_or(u32::MAX);
        self.delay.saturating_mul(excess)
    }

    /// Decide on a tracked window, sleeping first if the caller must be throttled.
    ///
    /// Only the calling task is suspended. The store is not consulted again
    /// after the wait.
    pub async fn decide(&self, state: WindowState) -> Decision {
        let remaining = self.limit - state.count;
        let wait = self.wait_for(remaining);

        let reset = if wait.is_zero() {
            state.reset
        } else {
            debug!(
                remaining,
                wait_ms = wait.as_millis() as u64,
                "Over limit, throttling caller"
            );
            tokio::time::sleep(wait).await;
            state.reset.saturating_sub(wait)
        };

        Decision {
            limit: self.limit,
            remaining,
            reset_ms: ceil_millis(reset),
            uses_delay: self.uses_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn state(count: i64, reset_ms: u64) -> WindowState {
        WindowState {
            count,
            reset: Duration::from_millis(reset_ms),
        }
    }

    #[tokio::test]
    async fn test_below_limit_without_delay() {
        let policy = DecisionPolicy::new(10, Duration::ZERO);
        let decision = policy.decide(state(6, 100)).await;

        assert_eq!(
            decision,
            Decision {
                limit: 10,
                remaining: 4,
                reset_ms: 100,
                uses_delay: false,
            }
        );
        assert!(decision.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_limit_without_delay_does_not_wait() {
        let policy = DecisionPolicy::new(10, Duration::ZERO);
        let start = Instant::now();
        let decision = policy.decide(state(11, 100)).await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(decision.remaining, -1);
        assert_eq!(decision.reset_ms, 100);
        assert!(!decision.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_limit_with_delay_does_not_wait() {
        let policy = DecisionPolicy::new(10, Duration::from_millis(50));
        let start = Instant::now();
        let decision = policy.decide(state(6, 100)).await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_ms, 100);
        assert!(decision.uses_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_limit_with_delay_waits_per_excess_trial() {
        let policy = DecisionPolicy::new(10, Duration::from_millis(30));
        let start = Instant::now();
        let decision = policy.decide(state(12, 100)).await;

        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(decision.remaining, -2);
        assert_eq!(decision.reset_ms, 40);
        assert!(decision.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_floors_at_zero_after_long_wait() {
        let policy = DecisionPolicy::new(1, Duration::from_millis(100));
        let decision = policy.decide(state(4, 100)).await;

        assert_eq!(decision.remaining, -3);
        assert_eq!(decision.reset_ms, 0);
    }

    #[test]
    fn test_wait_for() {
        let policy = DecisionPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.wait_for(0), Duration::ZERO);
        assert_eq!(policy.wait_for(-1), Duration::from_millis(100));
        assert_eq!(policy.wait_for(-3), Duration::from_millis(300));

        let hard = DecisionPolicy::new(5, Duration::ZERO);
        assert_eq!(hard.wait_for(-3), Duration::ZERO);
    }

    #[test]
    fn test_ceil_millis() {
        assert_eq!(ceil_millis(Duration::from_millis(5)), 5);
        assert_eq!(ceil_millis(Duration::from_micros(4_200)), 5);
        assert_eq!(ceil_millis(Duration::from_micros(300)), 1);
        assert_eq!(ceil_millis(Duration::ZERO), 0);
    }
}
