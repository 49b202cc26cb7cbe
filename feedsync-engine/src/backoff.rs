use std::time::Duration;

use shared::config::FeedSettings;

/// Bounded exponential backoff for feed reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    /// Builds a policy; `multiplier` below 1.0 is treated as 1.0.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_attempts,
        }
    }

    /// Number of consecutive failed attempts tolerated.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the `attempt`-th consecutive retry (1-based) may run.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay before the `attempt`-th consecutive retry (1-based).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        let ceiling = self.max.as_nanos() as f64;
        if !scaled.is_finite() || scaled >= ceiling {
            self.max
        } else {
            Duration::from_nanos(scaled.round() as u64)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&FeedSettings::default())
    }
}

impl From<&FeedSettings> for BackoffPolicy {
    fn from(settings: &FeedSettings) -> Self {
        Self::new(
            settings.initial_backoff(),
            settings.max_backoff(),
            settings.backoff_multiplier,
            settings.max_reconnect_attempts,
        )
    }
}
