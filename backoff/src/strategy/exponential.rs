use std::time::Duration;

use rand::Rng;

const DEFAULT_FACTOR: f64 = 2.0;

/// Grows the delay geometrically with every attempt, capped at `max_interval`.
///
/// The n-th delay is `base_interval * factor^(n - 1)`, optionally spread by `jitter`
/// (a fraction between 0.0 and 1.0 applied symmetrically around the computed delay).
/// The strategy never runs out; bound it with [`Iterator::take`].
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::new(Duration::from_millis(100), Duration::from_secs(1));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Exponential {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            factor: DEFAULT_FACTOR,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Multiplier applied per attempt. Values below 1.0 are raised to 1.0.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Randomization fraction, clamped to `0.0..=1.0`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            let spread = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
            delay_ms *= spread;
        }

        // f64 -> u64 casts saturate, so overflowing products still end up at the cap
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}
