//! # Expiration Planner
//!
//! Purpose: Build the backend entry options for a store, honoring
//! caller-supplied options verbatim and jittering only the TTLs the engine
//! constructed itself. Jitter spreads the recompute storms that follow a
//! population of keys being created together.

use std::time::Duration;

use rand::Rng;

use corral_core::{EntryOptions, MAX_JITTER_FRACTION};

/// Floor applied after jitter so a TTL never collapses to nothing.
const MIN_JITTERED_TTL: Duration = Duration::from_millis(1);

/// Builds the options for one store.
///
/// Caller-supplied options are cloned untouched; jitter would override
/// explicit caller intent. When the caller supplied nothing, the effective
/// hard TTL becomes a relative expiration, perturbed by `jitter_fraction`.
pub(crate) fn plan_store_options(
    caller: Option<&EntryOptions>,
    hard_ttl: Duration,
    jitter_fraction: f64,
) -> EntryOptions {
    match caller {
        Some(options) => options.clone(),
        None => EntryOptions::relative(apply_jitter(hard_ttl, jitter_fraction)),
    }
}

/// Scales `ttl` by a uniform factor in `[1 - f, 1 + f]`.
///
/// The fraction is clamped to `[0, 0.9]`; a zero fraction or zero TTL is
/// returned unchanged, and the result never drops below one millisecond.
pub(crate) fn apply_jitter(ttl: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, MAX_JITTER_FRACTION);
    if fraction == 0.0 || ttl.is_zero() {
        return ttl;
    }

    let delta: f64 = rand::thread_rng().gen_range(-fraction..=fraction);
    Duration::from_secs_f64(ttl.as_secs_f64() * (1.0 + delta)).max(MIN_JITTERED_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fraction_leaves_ttl_unchanged() {
        let ttl = Duration::from_secs(10);
        assert_eq!(apply_jitter(ttl, 0.0), ttl);
    }

    #[test]
    fn zero_ttl_is_exempt_from_jitter() {
        assert_eq!(apply_jitter(Duration::ZERO, 0.5), Duration::ZERO);
    }

    // 1us slack absorbs float-to-nanosecond rounding at the interval edges.
    const SLACK: Duration = Duration::from_micros(1);

    #[test]
    fn jitter_stays_within_fraction_bounds() {
        let ttl = Duration::from_millis(100);
        let fraction = 0.5;
        let low = Duration::from_millis(50) - SLACK;
        let high = Duration::from_millis(150) + SLACK;

        for _ in 0..200 {
            let jittered = apply_jitter(ttl, fraction);
            assert!(jittered >= low, "{jittered:?} below lower bound");
            assert!(jittered <= high, "{jittered:?} above upper bound");
            assert!(jittered >= MIN_JITTERED_TTL);
        }
    }

    #[test]
    fn oversized_fraction_is_clamped() {
        let ttl = Duration::from_millis(100);
        for _ in 0..200 {
            let jittered = apply_jitter(ttl, 5.0);
            // Clamped to 0.9, so the result stays within [10ms, 190ms].
            assert!(jittered >= Duration::from_millis(10) - SLACK);
            assert!(jittered <= Duration::from_millis(190) + SLACK);
        }
    }

    #[test]
    fn tiny_ttl_floors_at_one_millisecond() {
        for _ in 0..200 {
            assert!(apply_jitter(Duration::from_millis(1), 0.9) >= MIN_JITTERED_TTL);
        }
    }

    #[test]
    fn caller_options_pass_through_unjittered() {
        let caller = EntryOptions::relative(Duration::from_secs(30));
        for _ in 0..50 {
            let planned = plan_store_options(Some(&caller), Duration::from_secs(300), 0.9);
            assert_eq!(planned, caller);
        }
    }

    #[test]
    fn constructed_options_use_hard_ttl() {
        let planned = plan_store_options(None, Duration::from_secs(300), 0.0);
        assert_eq!(
            planned.absolute_expiration_relative_to_now,
            Some(Duration::from_secs(300))
        );
        assert!(planned.absolute_expiration.is_none());
        assert!(planned.sliding_expiration.is_none());
    }
}
