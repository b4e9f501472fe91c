// Exponential reconnect schedule: base * 2^(attempt-1), capped by attempt count.
use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::error::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_attempts }
    }

    /// Delay before `attempt` (1-based). Past the cap this is a terminal error.
    pub fn delay_for(&self, attempt: u32) -> Result<Duration, FeedError> {
        if attempt == 0 || attempt > self.max_attempts {
            return Err(FeedError::ReconnectExhausted { attempts: attempt.saturating_sub(1) });
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Ok(self.base_delay.saturating_mul(factor))
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self::new(Duration::from_millis(cfg.base_delay_ms), cfg.max_attempts)
    }
}

/// Attempt counter owned by one session's reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Result<Duration, FeedError> {
        self.attempt += 1;
        self.policy.delay_for(self.attempt)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence() {
        let p = ReconnectPolicy::new(Duration::from_millis(1000), 4);
        let delays: Vec<u128> = (1..=4).map(|a| p.delay_for(a).unwrap().as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert_eq!(p.delay_for(5), Err(FeedError::ReconnectExhausted { attempts: 4 }));
    }

    #[test]
    fn test_backoff_counter() {
        let mut b = Backoff::new(ReconnectPolicy::new(Duration::from_millis(10), 2));
        assert_eq!(b.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(b.next_delay().unwrap(), Duration::from_millis(20));
        assert!(b.next_delay().is_err());
        assert_eq!(b.attempts(), 3);
        b.reset();
        assert_eq!(b.next_delay().unwrap(), Duration::from_millis(10));
    }

    #[test]
    fn test_huge_attempts_saturate() {
        let p = ReconnectPolicy::new(Duration::from_secs(1), 100);
        assert!(p.delay_for(64).is_ok());
    }
}
