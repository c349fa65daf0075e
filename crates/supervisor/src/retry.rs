use std::time::Duration;

use tracing::error;

use bouncer_core::RetryBudget;

use crate::exit::ExitCause;

/// First pause before a respawn, doubled on every further attempt.
pub const RESPAWN_DELAY_INITIAL: Duration = Duration::from_millis(100);
pub const RESPAWN_DELAY_MAX: Duration = Duration::from_secs(5);

/// Delay before respawn `attempt` (1-based), capped at [`RESPAWN_DELAY_MAX`].
pub fn respawn_delay(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    RESPAWN_DELAY_INITIAL
        .saturating_mul(1 << doublings)
        .min(RESPAWN_DELAY_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Respawn { attempt: u32 },
    Fatal,
}

/// Counts unexpected exits against the configured budget. The counter only
/// ever grows; it is reset by restarting the bouncer.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    budget: RetryBudget,
    retry_count: u32,
}

impl RetryTracker {
    pub fn new(budget: RetryBudget) -> Self {
        Self {
            budget,
            retry_count: 0,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    pub fn on_exit(&mut self, cause: &ExitCause) -> Transition {
        match self.budget {
            RetryBudget::Unlimited => {
                self.retry_count = self.retry_count.saturating_add(1);
                error!("custom program exited (retry {}): {cause}", self.retry_count);
                Transition::Respawn {
                    attempt: self.retry_count,
                }
            }
            RetryBudget::Limited(total) if self.retry_count < total => {
                self.retry_count += 1;
                error!("custom program exited (retry {}/{total}): {cause}", self.retry_count);
                Transition::Respawn {
                    attempt: self.retry_count,
                }
            }
            RetryBudget::Limited(_) => {
                error!("custom program exited: {cause}");
                error!("maximum retries exceeded for program execution");
                Transition::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_allows_exactly_n_respawns() {
        let mut tracker = RetryTracker::new(RetryBudget::Limited(3));
        let killed = ExitCause::Signaled(9);
        assert_eq!(tracker.on_exit(&killed), Transition::Respawn { attempt: 1 });
        assert_eq!(tracker.on_exit(&killed), Transition::Respawn { attempt: 2 });
        assert_eq!(tracker.on_exit(&killed), Transition::Respawn { attempt: 3 });
        assert_eq!(tracker.on_exit(&killed), Transition::Fatal);
        assert_eq!(tracker.retry_count(), 3);
    }

    #[test]
    fn test_respawn_delay_doubles_up_to_cap() {
        assert_eq!(respawn_delay(1), Duration::from_millis(100));
        assert_eq!(respawn_delay(2), Duration::from_millis(200));
        assert_eq!(respawn_delay(4), Duration::from_millis(800));
        assert_eq!(respawn_delay(7), RESPAWN_DELAY_MAX);
        assert_eq!(respawn_delay(u32::MAX), RESPAWN_DELAY_MAX);
    }

    #[test]
    fn test_zero_budget_is_immediately_fatal() {
        let mut tracker = RetryTracker::new(RetryBudget::Limited(0));
        assert_eq!(tracker.on_exit(&ExitCause::Exited(1)), Transition::Fatal);
    }

    #[test]
    fn test_unlimited_budget_never_gives_up() {
        let mut tracker = RetryTracker::new(RetryBudget::Unlimited);
        for attempt in 1..=100 {
            assert_eq!(
                tracker.on_exit(&ExitCause::Exited(1)),
                Transition::Respawn { attempt }
            );
        }
    }
}
