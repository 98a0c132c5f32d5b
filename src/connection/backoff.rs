//! Retry delay computation for automatic reconnection.

use std::time::Duration;

/// Cap on the delay multiplier once attempts accumulate.
const MAX_MULTIPLIER: f64 = 2.0;

/// Compute the delay before retry `attempt` (1-based).
///
/// The base delay is scaled by `(attempt + 2) / 3`, so the first attempt
/// retries at roughly the initial delay and later ones ramp up to twice it
/// by the fourth. A jitter factor drawn uniformly from [0.8, 1.0] spreads
/// clients reconnecting after a shared outage, so attempt `n` always lands
/// in `[0.8 * m * initial, m * initial]` with `m = min((n + 2) / 3, 2)`.
pub fn retry_delay(initial: Duration, attempt: u32) -> Duration {
    let multiplier = ((attempt as f64 + 2.0) / 3.0).min(MAX_MULTIPLIER);
    let jitter = 0.8 + rand::random::<f64>() * 0.2;
    initial.mul_f64(multiplier * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(initial: Duration, attempt: u32) -> (Duration, Duration) {
        let multiplier = ((attempt as f64 + 2.0) / 3.0).min(MAX_MULTIPLIER);
        (
            initial.mul_f64(multiplier * 0.8),
            initial.mul_f64(multiplier),
        )
    }

    #[test]
    fn test_delay_bounds() {
        let initial = Duration::from_secs(15);
        for attempt in 1..=10 {
            let delay = retry_delay(initial, attempt);
            assert!(
                delay >= Duration::from_secs(12) && delay <= Duration::from_secs(30),
                "attempt {} produced {:?}",
                attempt,
                delay
            );
        }
    }

    #[test]
    fn test_attempts_land_in_their_band() {
        let initial = Duration::from_secs(15);
        for attempt in 1..=10 {
            let (low, high) = band(initial, attempt);
            for _ in 0..100 {
                let delay = retry_delay(initial, attempt);
                assert!(
                    delay >= low && delay <= high,
                    "attempt {} produced {:?}, outside [{:?}, {:?}]",
                    attempt,
                    delay,
                    low,
                    high
                );
            }
        }
    }

    #[test]
    fn test_second_attempt_outgrows_the_initial_delay() {
        let initial = Duration::from_secs(15);
        // m = 4/3 for the second attempt, so even fully jittered the delay
        // stays above the initial 15s
        let floor = initial.mul_f64(4.0 / 3.0 * 0.8);
        for _ in 0..1000 {
            assert!(retry_delay(initial, 2) >= floor);
        }
    }

    #[test]
    fn test_multiplier_caps_at_double() {
        let initial = Duration::from_secs(10);
        for attempt in [4, 7, 50] {
            let delay = retry_delay(initial, attempt);
            assert!(delay >= Duration::from_secs(16));
            assert!(delay <= Duration::from_secs(20));
        }
    }
}
