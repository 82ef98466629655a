use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter, applied between transaction
/// attempts and atom CAS rounds.
#[derive(Debug, Clone)]
pub(crate) struct RetryBackoff {
    initial: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Jittered delay for the given attempt number (0-indexed): uniform
    /// in `[d/2, d]` where `d = min(initial * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis().max(1) as u64;
        let ceiling = self.max.as_millis().max(1) as u64;
        let d = base
            .checked_shl(attempt.min(32))
            .unwrap_or(u64::MAX)
            .min(ceiling);
        let jittered = rand::rng().random_range(d.div_ceil(2)..=d);
        Duration::from_millis(jittered)
    }

    pub fn sleep(&self, attempt: u32) {
        std::thread::sleep(self.delay(attempt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_stays_bounded() {
        let b = RetryBackoff::new(Duration::from_millis(10), Duration::from_millis(500));
        for attempt in 0..40 {
            let d = b.delay(attempt);
            assert!(d >= Duration::from_millis(5), "attempt {attempt}: {d:?}");
            assert!(d <= Duration::from_millis(500), "attempt {attempt}: {d:?}");
        }
        // the un-jittered ceiling is reached by attempt 6 (10ms << 6 = 640ms)
        assert!(b.delay(6) >= Duration::from_millis(250));
    }

    #[test]
    fn zero_initial_is_tolerated() {
        let b = RetryBackoff::new(Duration::ZERO, Duration::from_millis(8));
        let d = b.delay(0);
        assert!(d <= Duration::from_millis(8));
    }
}
