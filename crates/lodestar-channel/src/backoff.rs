//! Exponential back-off with jitter for reconnect and retry scheduling.

use std::time::{Duration, Instant};

use rand::Rng;

/// Parameters for an exponential back-off schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First interval.
    pub initial: Duration,
    /// Growth factor applied on each step.
    pub multiplier: f64,
    /// Jitter fraction in `0..1`; each step is perturbed by `±jitter * interval`.
    pub jitter: f64,
    /// Upper bound on any interval.
    pub max: Duration,
    /// Floor applied to the first interval.
    pub min_connect_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max: Duration::from_secs(120),
            min_connect_timeout: Duration::from_millis(20),
        }
    }
}

/// Deadline generator implementing the begin/step/reset contract.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Creates a back-off at its initial interval.
    pub fn new(config: BackoffConfig) -> Backoff {
        let current = config.initial;
        Backoff { config, current }
    }

    /// Starts the schedule: stores the initial interval and returns the first
    /// deadline, floored by `min_connect_timeout`.
    pub fn begin(&mut self, now: Instant) -> Instant {
        self.current = self.config.initial;
        now + self.current.max(self.config.min_connect_timeout)
    }

    /// Advances the schedule: multiplies the stored interval, applies jitter
    /// of `±jitter * interval`, clamps to `max`, and returns the next deadline.
    pub fn step(&mut self, now: Instant) -> Instant {
        let grown = self.current.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.config.max.as_secs_f64()));
        let jitter_span = self.current.as_secs_f64() * self.config.jitter;
        let jittered = if jitter_span > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
            self.current.as_secs_f64() + offset
        } else {
            self.current.as_secs_f64()
        };
        let clamped = jittered.clamp(0.0, self.config.max.as_secs_f64());
        now + Duration::from_secs_f64(clamped)
    }

    /// Restores the initial interval.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// The stored (unjittered) interval; the next `step` grows from this.
    pub fn current_interval(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, multiplier: f64, jitter: f64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            multiplier,
            jitter,
            max: Duration::from_millis(max_ms),
            min_connect_timeout: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_begin_returns_initial_interval() {
        let mut backoff = Backoff::new(config(100, 2.0, 0.0, 1_000));
        let now = Instant::now();
        assert_eq!(backoff.begin(now), now + Duration::from_millis(100));
    }

    #[test]
    fn test_begin_applies_min_connect_floor() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(10),
            min_connect_timeout: Duration::from_millis(250),
            ..config(10, 2.0, 0.0, 1_000)
        });
        let now = Instant::now();
        assert_eq!(backoff.begin(now), now + Duration::from_millis(250));
    }

    #[test]
    fn test_step_grows_and_clamps_without_jitter() {
        let mut backoff = Backoff::new(config(100, 2.0, 0.0, 500));
        let now = Instant::now();
        backoff.begin(now);
        assert_eq!(backoff.step(now), now + Duration::from_millis(200));
        assert_eq!(backoff.step(now), now + Duration::from_millis(400));
        // 800 clamps to 500 and stays there.
        assert_eq!(backoff.step(now), now + Duration::from_millis(500));
        assert_eq!(backoff.step(now), now + Duration::from_millis(500));
    }

    #[test]
    fn test_step_jitter_stays_in_band() {
        let mut backoff = Backoff::new(config(100, 2.0, 0.2, 100_000));
        let now = Instant::now();
        backoff.begin(now);
        for expected_ms in [200.0f64, 400.0, 800.0] {
            let deadline = backoff.step(now);
            let interval = deadline.duration_since(now).as_secs_f64() * 1000.0;
            assert!(
                interval >= expected_ms * 0.8 - 1.0 && interval <= expected_ms * 1.2 + 1.0,
                "interval {interval}ms outside ±20% of {expected_ms}ms"
            );
        }
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut backoff = Backoff::new(config(100, 2.0, 0.0, 1_000));
        let now = Instant::now();
        backoff.begin(now);
        backoff.step(now);
        backoff.step(now);
        backoff.reset();
        assert_eq!(backoff.current_interval(), Duration::from_millis(100));
        assert_eq!(backoff.step(now), now + Duration::from_millis(200));
    }
}
