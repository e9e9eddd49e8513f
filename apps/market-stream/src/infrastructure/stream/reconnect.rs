//! Reconnection Policy
//!
//! Exponential backoff for feed reconnection. The delay before attempt `n`
//! (0-indexed) is `min(initial_delay * multiplier^n, max_delay)`, optionally
//! randomized by `±jitter_factor`.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Backoff settings for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Whether unexpected disconnects are retried at all.
    pub enabled: bool,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it (0 = exact).
    pub jitter_factor: f64,
    /// Attempts allowed before giving up. Always at least one.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Configuration that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial and maximum delays.
    #[must_use]
    pub const fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Un-jittered delay before attempt `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let initial = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = (initial * self.multiplier.powi(exponent)).round();

        #[allow(clippy::cast_precision_loss)]
        let max = self.max_delay.as_millis() as f64;
        let millis = if scaled.is_finite() { scaled.min(max) } else { max };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = millis.max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            enabled: settings.enabled,
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            multiplier: settings.backoff_multiplier,
            jitter_factor: settings.jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Stateful backoff tracker for one reconnection cycle.
///
/// # Example
///
/// ```rust
/// use market_stream::infrastructure::stream::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
///
/// // Connected again
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Policy at the start of a cycle.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, counting the attempt.
    ///
    /// Returns `None` when reconnection is disabled or every allowed attempt
    /// has been handed out.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.apply_jitter(self.config.delay_for_attempt(self.attempt_count));
        self.attempt_count += 1;
        Some(delay)
    }

    /// Start over after a successful reconnect.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.enabled && self.attempt_count < self.config.max_attempts
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`,
    /// never going below one millisecond.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let spread = self.config.jitter_factor;
        if spread <= 0.0 {
            return delay;
        }

        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor.max(0.0))
            .unwrap_or(delay)
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn defaults_give_five_exact_attempts() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn five_attempts_then_none() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

        let delays: Vec<u128> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis())
            .collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(policy.attempt_count(), 5);
        assert!(!policy.should_retry());
        assert!(policy.next_delay().is_none());
    }

    #[test_case(0, 1000 ; "first attempt")]
    #[test_case(4, 16000 ; "fifth attempt")]
    #[test_case(5, 30000 ; "capped at max")]
    #[test_case(200, 30000 ; "huge exponent stays capped")]
    fn delay_formula(attempt: u32, expected_ms: u64) {
        let config = ReconnectConfig::default();
        assert_eq!(
            config.delay_for_attempt(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn fractional_multiplier() {
        let config = ReconnectConfig {
            multiplier: 1.5,
            initial_delay: Duration::from_millis(100),
            ..ReconnectConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(150));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(225));
    }

    #[test]
    fn disabled_never_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::disabled());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 0);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default().with_max_attempts(3));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));

        policy.reset();
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(policy.attempt_count(), 1);
    }

    #[test]
    fn jitter_stays_within_spread() {
        let config = ReconnectConfig::default().with_jitter(0.1);
        for _ in 0..100 {
            let delay = ReconnectPolicy::new(config.clone())
                .next_delay()
                .unwrap();
            assert!(
                (Duration::from_millis(900)..=Duration::from_millis(1100)).contains(&delay),
                "{delay:?} outside 900ms..=1100ms"
            );
        }
    }

    #[test]
    fn converts_from_settings() {
        let settings = ReconnectSettings {
            enabled: false,
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 3.0,
            jitter: 0.2,
        };
        let config = ReconnectConfig::from(&settings);

        assert!(!config.enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(750));
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }
}
