use rand::Rng;
use std::time::Duration;

/// How long to wait between reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum Strategy {
    /// The same wait before every attempt.
    Every(Duration),
    /// Waits which double with each consecutive failure.
    Backoff(ExponentialBackoff),
}

impl Strategy {
    /// Wait before retry number `attempt`, counting from 1.
    pub(crate) fn delay(&self, attempt: usize) -> Duration {
        match self {
            Self::Every(t) => *t,
            Self::Backoff(exp) => exp.delay(attempt),
        }
    }
}

/// Doubling waits between `min` and `max`, each perturbed by up to
/// `jitter` of its length in either direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    /// Wait before the first retry, and the floor for every later one.
    ///
    /// *Defaults to 0.25s.*
    pub min: Duration,
    /// Ceiling on any wait. Values below `min` are treated as `min`.
    ///
    /// *Defaults to 10s.*
    pub max: Duration,
    /// Fraction of uniform noise added to each wait, e.g. `0.1` for +/-10%.
    ///
    /// Clamped to `0.0..=1.0`.
    ///
    /// *Defaults to `0.1`.*
    pub jitter: f32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(250),
            max: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        let ceiling = self.max.max(self.min);
        let doublings = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(31);
        let base = self
            .min
            .checked_mul(1 << doublings)
            .map_or(ceiling, |d| d.min(ceiling));

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f32(scale).clamp(self.min, ceiling)
    }
}
