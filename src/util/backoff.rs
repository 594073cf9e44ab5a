//! Retry delay schedules used across the reconnect and re-check loops.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a multiplicative jitter of 0–30%.
///
/// `attempt` is zero-based; the unjittered delay is `base · 2^attempt`,
/// capped at `max` before jitter is applied.
pub fn jittered(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX));
    let capped = exp.min(max);
    let jitter = rand::rng().random_range(0.0..0.30f64);
    capped.mul_f64(1.0 + jitter)
}

/// Deterministic variant of [`jittered`] without the random component.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX))
        .min(max)
}

/// Delay before the next confirmation re-check of a transaction that has
/// accumulated `confirmations` so far: `min(60 · 2^(confs / 2), 3600)`
/// seconds. Checks thin out as a transaction ages.
pub fn confirmation_check_delay(confirmations: u32) -> Duration {
    let exp = confirmations / 2;
    let secs = 60u64
        .checked_shl(exp.min(10))
        .unwrap_or(u64::MAX)
        .min(3600);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let base = Duration::from_secs(15);
        let max = Duration::from_secs(120);
        assert_eq!(exponential(base, max, 0), Duration::from_secs(15));
        assert_eq!(exponential(base, max, 1), Duration::from_secs(30));
        assert_eq!(exponential(base, max, 2), Duration::from_secs(60));
        assert_eq!(exponential(base, max, 3), Duration::from_secs(120));
        assert_eq!(exponential(base, max, 12), Duration::from_secs(120));
    }

    #[test]
    fn jitter_stays_within_band() {
        let base = Duration::from_secs(15);
        let max = Duration::from_secs(600);
        for attempt in 0..8 {
            let plain = exponential(base, max, attempt);
            let d = jittered(base, max, attempt);
            assert!(d >= plain, "jitter never shortens the delay");
            assert!(d <= plain.mul_f64(1.30), "jitter caps at +30%");
        }
    }

    #[test]
    fn confirmation_delays_grow_to_an_hour() {
        assert_eq!(confirmation_check_delay(0), Duration::from_secs(60));
        assert_eq!(confirmation_check_delay(1), Duration::from_secs(60));
        assert_eq!(confirmation_check_delay(2), Duration::from_secs(120));
        assert_eq!(confirmation_check_delay(4), Duration::from_secs(240));
        assert_eq!(confirmation_check_delay(6), Duration::from_secs(480));
        assert_eq!(confirmation_check_delay(100), Duration::from_secs(3600));
    }
}
