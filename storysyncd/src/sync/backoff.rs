use rand::Rng;
use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_secs(2);
const DEFAULT_CAP: Duration = Duration::from_secs(300);
const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// `min(base^attempt, cap) * jitter`, with `base` measured in seconds and
/// jitter drawn from `[0.8, 1.2]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP, true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let cap_secs = self.max.as_secs_f64();
        let exp_secs = self.base.as_secs_f64().powi(exponent).min(cap_secs);
        let delay_secs = if self.jitter {
            exp_secs * rng.gen_range(JITTER_LOW..=JITTER_HIGH)
        } else {
            exp_secs
        };
        Duration::from_secs_f64(delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential_then_capped() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(0, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff.delay_with_rng(1, &mut rng), Duration::from_secs(2));
        assert_eq!(backoff.delay_with_rng(3, &mut rng), Duration::from_secs(8));
        assert_eq!(backoff.delay_with_rng(8, &mut rng), Duration::from_secs(256));
        assert_eq!(backoff.delay_with_rng(9, &mut rng), Duration::from_secs(300));
        assert_eq!(backoff.delay_with_rng(200, &mut rng), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..20 {
            let nominal = 2f64.powi(attempt as i32).min(300.0);
            let delay = backoff.delay_with_rng(attempt, &mut rng).as_secs_f64();
            assert!(delay >= nominal * 0.8 - 1e-9, "attempt {attempt}: {delay}");
            assert!(delay <= nominal * 1.2 + 1e-9, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn large_attempts_sit_at_the_cap() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 9..40 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay >= Duration::from_secs(240));
            assert!(delay <= Duration::from_secs(360));
        }
    }

    #[test]
    fn expected_delay_is_non_decreasing() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut previous = 0.0;
        for attempt in 0..12 {
            let mean = (0..200)
                .map(|_| backoff.delay_with_rng(attempt, &mut rng).as_secs_f64())
                .sum::<f64>()
                / 200.0;
            // Means at the cap are equal up to sampling noise.
            assert!(mean >= previous * 0.95, "attempt {attempt}: {mean} < {previous}");
            previous = mean;
        }
    }
}
