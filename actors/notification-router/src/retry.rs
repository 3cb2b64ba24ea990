//! Retry delay schedules

use routing_common::{BackoffStrategy, RetryPlan};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPlanner;

impl RetryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// `max_retries` delays grown from `base_delay`. Overflow saturates.
    pub fn plan(&self, max_retries: u32, base_delay: Duration, strategy: BackoffStrategy) -> RetryPlan {
        let delays = (0..max_retries)
            .map(|attempt| match strategy {
                BackoffStrategy::Fixed => base_delay,
                BackoffStrategy::Linear => base_delay.saturating_mul(attempt.saturating_add(1)),
                BackoffStrategy::Exponential => {
                    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                    base_delay.saturating_mul(factor)
                }
            })
            .collect();

        RetryPlan {
            max_retries,
            strategy,
            base_delay,
            delays,
        }
    }

    /// Plan with the defaults filled in for absent inputs
    pub fn plan_or_default(
        &self,
        max_retries: Option<u32>,
        base_delay: Option<Duration>,
        strategy: Option<BackoffStrategy>,
    ) -> RetryPlan {
        self.plan(
            max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay.unwrap_or(DEFAULT_BASE_DELAY),
            strategy.unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_schedule_shapes() {
        let planner = RetryPlanner::new();
        let base = Duration::from_secs(60);
        assert_eq!(planner.plan(3, base, BackoffStrategy::Exponential).delays, secs(&[60, 120, 240]));
        assert_eq!(planner.plan(3, base, BackoffStrategy::Linear).delays, secs(&[60, 120, 180]));
        assert_eq!(planner.plan(3, base, BackoffStrategy::Fixed).delays, secs(&[60, 60, 60]));
    }

    #[test]
    fn test_defaults() {
        let plan = RetryPlanner::new().plan_or_default(None, None, None);
        assert_eq!(plan.max_retries, 3);
        assert_eq!(plan.strategy, BackoffStrategy::Exponential);
        assert_eq!(plan.delays, secs(&[60, 120, 240]));
    }

    #[test]
    fn test_zero_retries_is_empty() {
        let plan = RetryPlanner::new().plan(0, DEFAULT_BASE_DELAY, BackoffStrategy::Linear);
        assert!(plan.delays.is_empty());
    }

    #[test]
    fn test_exponential_saturates() {
        let plan = RetryPlanner::new().plan(40, Duration::from_secs(u64::MAX / 4), BackoffStrategy::Exponential);
        assert_eq!(plan.delays.len(), 40);
        assert_eq!(plan.delays[39], Duration::MAX);
        assert!(plan.delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
