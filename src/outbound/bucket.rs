//! Dual token buckets covering message count and payload bytes.

use std::time::Instant;

use crate::core::config::RateLimiterConfig;

/// Message and byte token buckets refilled continuously from elapsed time.
///
/// Both buckets start full. The byte bucket is only consulted when byte
/// limiting is enabled in the configuration.
#[derive(Debug)]
pub struct TokenBuckets {
    message_tokens: f64,
    byte_tokens: f64,
    last_refill: Instant,
}

impl TokenBuckets {
    /// Full buckets sized from `config`.
    pub fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            message_tokens: f64::from(config.max_burst_size),
            byte_tokens: config.max_burst_bytes as f64,
            last_refill: now,
        }
    }

    /// Add tokens for the time elapsed since the last refill, scaled by the
    /// adaptive `rate_multiplier`, clamped to burst capacity.
    pub fn refill(&mut self, config: &RateLimiterConfig, rate_multiplier: f32, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if elapsed <= 0.0 {
            return;
        }
        let rate = f64::from(config.max_messages_per_second) * f64::from(rate_multiplier);
        self.message_tokens =
            (self.message_tokens + elapsed * rate).min(f64::from(config.max_burst_size));
        if config.enable_bytes_rate_limiting {
            let byte_rate = config.max_bytes_per_second as f64 * f64::from(rate_multiplier);
            self.byte_tokens =
                (self.byte_tokens + elapsed * byte_rate).min(config.max_burst_bytes as f64);
        }
    }

    /// Whether a send of `bytes` could be paid for right now.
    pub fn can_afford(&self, config: &RateLimiterConfig, bytes: usize) -> bool {
        if self.message_tokens < 1.0 {
            return false;
        }
        !config.enable_bytes_rate_limiting || self.byte_tokens >= bytes as f64
    }

    /// Pay for a send of `bytes`. Callers check [`can_afford`](Self::can_afford)
    /// first; tokens saturate at zero regardless.
    pub fn consume(&mut self, config: &RateLimiterConfig, bytes: usize) {
        self.message_tokens = (self.message_tokens - 1.0).max(0.0);
        if config.enable_bytes_rate_limiting {
            self.byte_tokens = (self.byte_tokens - bytes as f64).max(0.0);
        }
    }

    /// Message tokens currently available.
    pub fn message_tokens(&self) -> f64 {
        self.message_tokens
    }

    /// Byte tokens currently available.
    pub fn byte_tokens(&self) -> f64 {
        self.byte_tokens
    }

    /// Clamp token levels to the burst capacities in `config`. Used when the
    /// configuration is swapped at runtime for one with smaller bursts.
    pub fn clamp(&mut self, config: &RateLimiterConfig) {
        self.message_tokens = self.message_tokens.min(f64::from(config.max_burst_size));
        self.byte_tokens = self.byte_tokens.min(config.max_burst_bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_full_and_drains() {
        let config = RateLimiterConfig::default();
        let now = Instant::now();
        let mut buckets = TokenBuckets::new(&config, now);
        for _ in 0..config.max_burst_size {
            assert!(buckets.can_afford(&config, 100));
            buckets.consume(&config, 100);
        }
        assert!(!buckets.can_afford(&config, 100));
    }

    #[test]
    fn refills_with_elapsed_time() {
        let config = RateLimiterConfig::default();
        let now = Instant::now();
        let mut buckets = TokenBuckets::new(&config, now);
        for _ in 0..config.max_burst_size {
            buckets.consume(&config, 0);
        }
        // 100ms at 50 msg/s restores five tokens.
        buckets.refill(&config, 1.0, now + Duration::from_millis(100));
        assert!(buckets.message_tokens() >= 4.9);
        assert!(buckets.message_tokens() <= 5.1);
    }

    #[test]
    fn rate_multiplier_scales_refill() {
        let config = RateLimiterConfig::default();
        let now = Instant::now();
        let mut buckets = TokenBuckets::new(&config, now);
        for _ in 0..config.max_burst_size {
            buckets.consume(&config, 0);
        }
        buckets.refill(&config, 0.1, now + Duration::from_millis(100));
        assert!(buckets.message_tokens() < 1.0);
    }

    #[test]
    fn byte_budget_blocks_large_sends() {
        let config = RateLimiterConfig::default();
        let now = Instant::now();
        let mut buckets = TokenBuckets::new(&config, now);
        assert!(!buckets.can_afford(&config, config.max_burst_bytes + 1));
        assert!(buckets.can_afford(&config, config.max_burst_bytes));
    }

    #[test]
    fn clamp_trims_tokens_to_smaller_bursts() {
        let config = RateLimiterConfig::default();
        let now = Instant::now();
        let mut buckets = TokenBuckets::new(&config, now);
        let smaller = RateLimiterConfig {
            max_burst_size: 5,
            max_burst_bytes: 1024,
            ..RateLimiterConfig::default()
        };
        buckets.clamp(&smaller);
        assert_eq!(buckets.message_tokens(), 5.0);
        assert_eq!(buckets.byte_tokens(), 1024.0);
    }

    #[test]
    fn byte_budget_ignored_when_disabled() {
        let config = RateLimiterConfig {
            enable_bytes_rate_limiting: false,
            ..RateLimiterConfig::default()
        };
        let now = Instant::now();
        let buckets = TokenBuckets::new(&config, now);
        assert!(buckets.can_afford(&config, usize::MAX));
    }
}
