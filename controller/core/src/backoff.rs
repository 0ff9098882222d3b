use std::time::Duration;
use tokio::time;

/// Delay policy for retry loops. Attempts are unbounded; callers decide when
/// to give up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `min` on each attempt, capped at `max`.
    Exponential { min: Duration, max: Duration },
}

/// Tracks consecutive failures against a [`Backoff`] policy.
#[derive(Clone, Debug)]
pub struct Retry {
    policy: Backoff,
    attempts: u32,
}

// === impl Backoff ===

impl Backoff {
    pub const fn exponential(min: Duration, max: Duration) -> Self {
        Self::Exponential { min, max }
    }

    /// The delay to apply before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { min, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                min.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }

    pub fn retry(self) -> Retry {
        Retry {
            policy: self,
            attempts: 0,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(30))
    }
}

// === impl Retry ===

impl Retry {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the next delay and records the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Sleeps for the next delay. Dropping the future cancels the wait.
    pub async fn wait(&mut self) {
        time::sleep(self.next_delay()).await
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
