//! Reconnection Policy
//!
//! Backoff between reconnect attempts, either a fixed delay or exponential
//! growth with a cap, plus jitter to avoid thundering herds. The attempt
//! count is capped; a successful connection resets the policy.

use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay, as a fraction of the base delay.
const JITTER_FACTOR: f64 = 0.1;

/// Backoff schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffSchedule {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// Exponentially growing delay, capped at `max`.
    Exponential {
        /// Delay before the first attempt.
        initial: Duration,
        /// Upper bound for the delay.
        max: Duration,
        /// Growth factor applied after each attempt.
        multiplier: f64,
    },
}

impl BackoffSchedule {
    /// The delay used for the first attempt.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial, .. } => *initial,
        }
    }
}

impl Default for BackoffSchedule {
    /// 1s doubling up to 60s, matching the service's recommended client
    /// behavior.
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Stateful reconnect policy for one connection.
///
/// # Example
///
/// ```rust
/// use tickmux::{BackoffSchedule, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(BackoffSchedule::default(), 3);
/// assert!(policy.next_delay().is_some());
///
/// // A successful connection starts the schedule over.
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    schedule: BackoffSchedule,
    jitter_factor: f64,
    max_attempts: u32,
    attempt: u32,
    current: Duration,
}

impl ReconnectPolicy {
    /// Create a policy. `max_attempts` of zero means unlimited attempts.
    #[must_use]
    pub fn new(schedule: BackoffSchedule, max_attempts: u32) -> Self {
        Self {
            schedule,
            jitter_factor: JITTER_FACTOR,
            max_attempts,
            attempt: 0,
            current: schedule.initial_delay(),
        }
    }

    /// Disable or adjust jitter; used by tests that need exact delays.
    #[must_use]
    pub const fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// The delay to wait before the next attempt, or `None` when attempts
    /// are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;

        let delay = self.apply_jitter(self.current);

        if let BackoffSchedule::Exponential {
            max, multiplier, ..
        } = self.schedule
        {
            #[allow(clippy::cast_precision_loss)]
            let scaled = (self.current.as_millis() as f64 * multiplier).round();
            let next_millis = if scaled.is_finite() && scaled > 0.0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    scaled as u128
                }
            } else {
                0
            };
            let capped = next_millis.min(max.as_millis());
            self.current = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));
        }

        Some(delay)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.schedule.initial_delay();
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.max_attempts == 0 || self.attempt < self.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted as u64)
    }
}
