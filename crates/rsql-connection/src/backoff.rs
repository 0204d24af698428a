//! Exponential backoff between transaction attempts

use std::time::Duration;

/// Exponential backoff strategy for re-running aborted transactions.
///
/// Delays grow by `multiplier` with each retry, up to `max`. No jitter:
/// contention between retrying clients is resolved by the server's own
/// transaction priorities.
///
/// # Example
///
/// ```
/// use rsql_connection::BackoffStrategy;
/// use std::time::Duration;
///
/// let backoff = BackoffStrategy::new(Duration::from_millis(10), Duration::from_secs(1));
/// assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
/// assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
/// assert_eq!(backoff.delay_for(20), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl BackoffStrategy {
    /// Create a backoff starting at `initial` and capped at `max`.
    ///
    /// `initial` is at least 1ms and `max` at least `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
        }
    }

    /// Set the growth factor (at least 1.0, default 2.0)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !delay_nanos.is_finite() || delay_nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(delay_nanos.round() as u64)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for BackoffStrategy {
    /// 50ms initial, 5 seconds max, 2x multiplier
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = BackoffStrategy::new(ms(100), ms(30_000));
        assert_eq!(backoff.delay_for(0), ms(100));
        assert_eq!(backoff.delay_for(1), ms(200));
        assert_eq!(backoff.delay_for(2), ms(400));
        assert_eq!(backoff.delay_for(4), ms(1600));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = BackoffStrategy::new(ms(100), ms(1000));
        assert_eq!(backoff.delay_for(10), ms(1000));
        assert_eq!(backoff.delay_for(u32::MAX), ms(1000));
    }

    #[test]
    fn test_custom_multiplier() {
        let backoff = BackoffStrategy::new(ms(100), ms(30_000)).with_multiplier(3.0);
        assert_eq!(backoff.delay_for(1), ms(300));
        assert_eq!(backoff.delay_for(2), ms(900));
    }

    #[test]
    fn test_clamped_inputs() {
        assert_eq!(BackoffStrategy::new(ms(0), ms(10)).initial_delay(), ms(1));
        assert_eq!(BackoffStrategy::new(ms(1000), ms(100)).max_delay(), ms(1000));

        let flat = BackoffStrategy::new(ms(100), ms(1000)).with_multiplier(0.5);
        assert_eq!(flat.multiplier(), 1.0);
        assert_eq!(flat.delay_for(5), ms(100));
        let nan = BackoffStrategy::default().with_multiplier(f64::NAN);
        assert_eq!(nan.multiplier(), 1.0);
    }

    #[test]
    fn test_default() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.initial_delay(), ms(50));
        assert_eq!(backoff.max_delay(), ms(5000));
        assert_eq!(backoff.multiplier(), 2.0);
    }
}
