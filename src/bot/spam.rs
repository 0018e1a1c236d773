// src/bot/spam.rs - Per-user sliding window rate limiting

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::SpamConfig;
use crate::error::PolicyViolation;
use crate::types::UserId;

/// Timestamps inside the trailing window plus the user's previous message,
/// which the cooldown compares against even after it has left the window.
#[derive(Debug, Default)]
struct SpamWindow {
    timestamps: Vec<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

/// Tracks recent message timestamps per user.
///
/// Two submissions from the same user racing through `check` may both see the
/// window before the other's append; this is accepted.
#[derive(Clone)]
pub struct SpamLimiter {
    windows: Arc<RwLock<HashMap<UserId, SpamWindow>>>,
    window: chrono::Duration,
    cooldown: chrono::Duration,
    threshold: usize,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl SpamLimiter {
    pub fn new(window: Duration, threshold: usize, cooldown: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            window: to_chrono(window),
            cooldown: to_chrono(cooldown),
            threshold,
        }
    }

    pub fn from_config(config: &SpamConfig) -> Self {
        Self::new(config.window(), config.threshold, config.cooldown())
    }

    pub async fn check(&self, user_id: UserId) -> Result<(), PolicyViolation> {
        self.check_at(user_id, Utc::now()).await
    }

    /// Record a message at `now` and evaluate the thresholds.
    pub async fn check_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(), PolicyViolation> {
        let mut windows = self.windows.write().await;
        let entry = windows.entry(user_id).or_default();

        let previous = entry.last_seen.replace(now);
        entry.timestamps.push(now);
        let window = self.window;
        entry.timestamps.retain(|t| now - *t <= window);

        if entry.timestamps.len() > self.threshold {
            debug!("User {} exceeded {} messages in window", user_id, self.threshold);
            return Err(PolicyViolation::RateLimited);
        }

        if let Some(previous) = previous {
            if now - previous < self.cooldown {
                return Err(PolicyViolation::TooFast);
            }
        }

        Ok(())
    }

    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(Utc::now()).await
    }

    /// Drop windows whose newest entry can no longer influence a decision.
    pub async fn evict_idle_at(&self, now: DateTime<Utc>) -> usize {
        let horizon = std::cmp::max(self.window, self.cooldown);
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, entry| match entry.last_seen {
            Some(newest) => now - newest <= horizon,
            None => false,
        });
        let evicted = before - windows.len();
        if evicted > 0 {
            debug!("Evicted {} idle spam windows", evicted);
        }
        evicted
    }

    pub async fn tracked_users(&self) -> usize {
        self.windows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> SpamLimiter {
        SpamLimiter::from_config(&SpamConfig::default())
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[tokio::test]
    async fn test_ninth_message_in_window_is_rate_limited() {
        // cooldown disabled so only the count threshold applies
        let limiter = SpamLimiter::new(Duration::from_secs(1), 8, Duration::ZERO);
        let start = Utc::now();

        for i in 0..8 {
            assert_eq!(limiter.check_at(7, start + ms(i * 100)).await, Ok(()));
        }
        assert_eq!(limiter.check_at(7, start + ms(850)).await, Err(PolicyViolation::RateLimited));
    }

    #[tokio::test]
    async fn test_burst_with_default_cooldown_is_rate_limited_on_ninth() {
        let limiter = limiter();
        let start = Utc::now();
        let mut results = Vec::new();
        for i in 0..9 {
            results.push(limiter.check_at(7, start + ms(i * 100)).await);
        }
        assert_eq!(results[0], Ok(()));
        assert!(results[1..8].iter().all(|r| *r == Err(PolicyViolation::TooFast)));
        assert_eq!(results[8], Err(PolicyViolation::RateLimited));
    }

    #[tokio::test]
    async fn test_gap_shorter_than_cooldown_is_too_fast() {
        // the first message has already left the 1s window
        let limiter = limiter();
        let start = Utc::now();

        assert_eq!(limiter.check_at(1, start).await, Ok(()));
        assert_eq!(limiter.check_at(1, start + ms(1500)).await, Err(PolicyViolation::TooFast));
    }

    #[tokio::test]
    async fn test_spaced_messages_never_hit_timing_rules() {
        let limiter = limiter();
        let start = Utc::now();
        for i in 0..20 {
            assert_eq!(limiter.check_at(3, start + ms(i * 2100)).await, Ok(()));
        }
    }

    #[tokio::test]
    async fn test_users_are_tracked_independently() {
        let limiter = limiter();
        let now = Utc::now();
        assert_eq!(limiter.check_at(1, now).await, Ok(()));
        assert_eq!(limiter.check_at(2, now).await, Ok(()));
    }

    #[tokio::test]
    async fn test_evict_idle_windows() {
        let limiter = limiter();
        let now = Utc::now();
        limiter.check_at(1, now).await.unwrap();
        limiter.check_at(2, now + ms(1900)).await.unwrap();

        let evicted = limiter.evict_idle_at(now + ms(2500)).await;
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_users().await, 1);
    }
}
