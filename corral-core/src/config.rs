//! # Policy and Configuration
//!
//! Purpose: Hold the process-wide defaults and the per-call overrides that
//! drive freshness decisions, and resolve the two into one effective view.
//!
//! ## Design Principles
//! 1. **Plain Data**: Config and policy are `Clone` structs with `Default`,
//!    replaceable wholesale; no hidden state.
//! 2. **Override-or-Fallback**: Every unset policy field falls through to the
//!    global config, resolved once per call.
//! 3. **Clamped Inputs**: Out-of-range fractions and inverted TTLs are
//!    normalized during resolution rather than rejected at call time.

use std::time::Duration;

/// Upper bound for the expiration jitter fraction.
///
/// Anything above this would let a jittered TTL collapse toward zero and
/// defeat the point of caching.
pub const MAX_JITTER_FRACTION: f64 = 0.9;

/// Process-wide defaults for the caching layer.
#[derive(Debug, Clone)]
pub struct CorralConfig {
    /// Lifetime after which an entry must be recomputed before serving.
    pub default_hard_ttl: Duration,
    /// Lifetime after which an entry is stale but still serveable.
    pub default_soft_ttl: Duration,
    /// Fraction `f` in `[0, 0.9]`; engine-built TTLs are perturbed by a
    /// uniform factor in `[1-f, 1+f]`.
    pub expiration_jitter_fraction: f64,
    /// Prefix prepended to every key. Empty or whitespace means no prefix.
    pub key_prefix: String,
    /// Idle window after which an unreferenced key lock is evicted.
    pub key_lock_eviction_window: Duration,
    /// Serialized payloads larger than this are returned but not stored.
    pub max_payload_bytes: Option<usize>,
    /// Skip storing values equal to their type's default.
    pub skip_caching_default: bool,
    /// Bound on gate waits; `None` waits indefinitely.
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for CorralConfig {
    fn default() -> Self {
        CorralConfig {
            default_hard_ttl: Duration::from_secs(300),
            default_soft_ttl: Duration::from_secs(60),
            expiration_jitter_fraction: 0.0,
            key_prefix: String::new(),
            key_lock_eviction_window: Duration::from_secs(60),
            max_payload_bytes: None,
            skip_caching_default: false,
            lock_wait_timeout: None,
        }
    }
}

impl CorralConfig {
    /// Returns the configured prefix, treating blank strings as no prefix.
    pub fn effective_prefix(&self) -> Option<&str> {
        let trimmed = self.key_prefix.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(self.key_prefix.as_str())
        }
    }
}

/// Per-call overrides; unset fields fall through to [`CorralConfig`].
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    /// Override for the stale-while-revalidate threshold.
    pub soft_ttl: Option<Duration>,
    /// Override for the must-recompute threshold.
    pub hard_ttl: Option<Duration>,
    /// How far past hard expiry a value may still be served when the gate
    /// times out (`None` leaves that serve unbounded). Setting a bound also
    /// enables serving stale instead of surfacing a compute failure.
    pub max_stale_on_failure: Option<Duration>,
    /// Window before hard expiry in which a fresh hit proactively refreshes.
    pub early_refresh_window: Option<Duration>,
    /// Override for the jitter fraction.
    pub expiration_jitter_fraction: Option<f64>,
    /// Override for the gate wait bound.
    pub lock_wait_timeout: Option<Duration>,
    /// Override for the payload size cap.
    pub max_payload_bytes: Option<usize>,
    /// Override for default-value skipping.
    pub skip_caching_default: Option<bool>,
}

/// One call's resolved view of policy + config.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub max_stale_on_failure: Option<Duration>,
    /// Zero disables early refresh.
    pub early_refresh_window: Duration,
    pub jitter_fraction: f64,
    pub lock_wait_timeout: Option<Duration>,
    pub max_payload_bytes: Option<usize>,
    pub skip_caching_default: bool,
}

impl EffectivePolicy {
    /// Resolves a call's policy against the global config.
    ///
    /// The jitter fraction is clamped to `[0, 0.9]` and the soft TTL to the
    /// hard TTL; a soft window longer than the hard one has no meaning.
    pub fn resolve(policy: Option<&CachePolicy>, config: &CorralConfig) -> Self {
        let hard_ttl = policy
            .and_then(|p| p.hard_ttl)
            .unwrap_or(config.default_hard_ttl);
        let soft_ttl = policy
            .and_then(|p| p.soft_ttl)
            .unwrap_or(config.default_soft_ttl)
            .min(hard_ttl);
        let jitter = policy
            .and_then(|p| p.expiration_jitter_fraction)
            .unwrap_or(config.expiration_jitter_fraction)
            .clamp(0.0, MAX_JITTER_FRACTION);

        EffectivePolicy {
            soft_ttl,
            hard_ttl,
            max_stale_on_failure: policy.and_then(|p| p.max_stale_on_failure),
            early_refresh_window: policy
                .and_then(|p| p.early_refresh_window)
                .unwrap_or(Duration::ZERO),
            jitter_fraction: jitter,
            lock_wait_timeout: policy
                .and_then(|p| p.lock_wait_timeout)
                .or(config.lock_wait_timeout),
            max_payload_bytes: policy
                .and_then(|p| p.max_payload_bytes)
                .or(config.max_payload_bytes),
            skip_caching_default: policy
                .and_then(|p| p.skip_caching_default)
                .unwrap_or(config.skip_caching_default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_config() {
        let config = CorralConfig {
            default_hard_ttl: Duration::from_secs(100),
            default_soft_ttl: Duration::from_secs(10),
            lock_wait_timeout: Some(Duration::from_millis(250)),
            ..CorralConfig::default()
        };

        let eff = EffectivePolicy::resolve(None, &config);
        assert_eq!(eff.hard_ttl, Duration::from_secs(100));
        assert_eq!(eff.soft_ttl, Duration::from_secs(10));
        assert_eq!(eff.lock_wait_timeout, Some(Duration::from_millis(250)));
        assert_eq!(eff.early_refresh_window, Duration::ZERO);
        assert!(!eff.skip_caching_default);
    }

    #[test]
    fn policy_overrides_win() {
        let config = CorralConfig::default();
        let policy = CachePolicy {
            soft_ttl: Some(Duration::from_secs(1)),
            hard_ttl: Some(Duration::from_secs(7)),
            lock_wait_timeout: Some(Duration::from_millis(50)),
            skip_caching_default: Some(true),
            ..CachePolicy::default()
        };

        let eff = EffectivePolicy::resolve(Some(&policy), &config);
        assert_eq!(eff.soft_ttl, Duration::from_secs(1));
        assert_eq!(eff.hard_ttl, Duration::from_secs(7));
        assert_eq!(eff.lock_wait_timeout, Some(Duration::from_millis(50)));
        assert!(eff.skip_caching_default);
    }

    #[test]
    fn jitter_fraction_is_clamped() {
        let config = CorralConfig::default();
        let policy = CachePolicy {
            expiration_jitter_fraction: Some(2.5),
            ..CachePolicy::default()
        };
        let eff = EffectivePolicy::resolve(Some(&policy), &config);
        assert_eq!(eff.jitter_fraction, MAX_JITTER_FRACTION);

        let negative = CachePolicy {
            expiration_jitter_fraction: Some(-0.3),
            ..CachePolicy::default()
        };
        let eff = EffectivePolicy::resolve(Some(&negative), &config);
        assert_eq!(eff.jitter_fraction, 0.0);
    }

    #[test]
    fn soft_ttl_clamped_to_hard() {
        let config = CorralConfig::default();
        let policy = CachePolicy {
            soft_ttl: Some(Duration::from_secs(30)),
            hard_ttl: Some(Duration::from_secs(5)),
            ..CachePolicy::default()
        };
        let eff = EffectivePolicy::resolve(Some(&policy), &config);
        assert_eq!(eff.soft_ttl, Duration::from_secs(5));
    }

    #[test]
    fn blank_prefix_means_none() {
        let mut config = CorralConfig::default();
        assert!(config.effective_prefix().is_none());

        config.key_prefix = "   ".to_string();
        assert!(config.effective_prefix().is_none());

        config.key_prefix = "tenant:".to_string();
        assert_eq!(config.effective_prefix(), Some("tenant:"));
    }
}
