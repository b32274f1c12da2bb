//! # Entry Options
//!
//! Purpose: Describe the lifetime a stored payload should have in the
//! backend. The struct mirrors what distributed caches accept natively:
//! an absolute deadline, a deadline relative to the write, or a sliding
//! window renewed on access.

use std::time::{Duration, SystemTime};

/// Backend expiration options attached to a `set`.
///
/// All fields are optional; an entirely empty value means "backend default /
/// no expiration". Callers keep ownership of their options — the engine
/// clones them before applying any mutation, so a caller-supplied value is
/// never changed behind the caller's back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryOptions {
    /// Absolute wall-clock deadline.
    pub absolute_expiration: Option<SystemTime>,
    /// Deadline measured from the moment of the write.
    pub absolute_expiration_relative_to_now: Option<Duration>,
    /// Idle window renewed whenever the entry is read.
    pub sliding_expiration: Option<Duration>,
}

impl EntryOptions {
    /// Options expiring at a fixed point in time.
    pub fn absolute(deadline: SystemTime) -> Self {
        EntryOptions {
            absolute_expiration: Some(deadline),
            ..EntryOptions::default()
        }
    }

    /// Options expiring a fixed duration after the write.
    pub fn relative(ttl: Duration) -> Self {
        EntryOptions {
            absolute_expiration_relative_to_now: Some(ttl),
            ..EntryOptions::default()
        }
    }

    /// Options expiring after an idle window, renewed on each read.
    pub fn sliding(window: Duration) -> Self {
        EntryOptions {
            sliding_expiration: Some(window),
            ..EntryOptions::default()
        }
    }

    /// Returns true when no expiration field is set.
    pub fn is_empty(&self) -> bool {
        self.absolute_expiration.is_none()
            && self.absolute_expiration_relative_to_now.is_none()
            && self.sliding_expiration.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert!(EntryOptions::default().is_empty());
    }

    #[test]
    fn constructors_set_single_field() {
        let rel = EntryOptions::relative(Duration::from_secs(5));
        assert_eq!(
            rel.absolute_expiration_relative_to_now,
            Some(Duration::from_secs(5))
        );
        assert!(rel.absolute_expiration.is_none());
        assert!(rel.sliding_expiration.is_none());

        let sliding = EntryOptions::sliding(Duration::from_secs(30));
        assert!(!sliding.is_empty());
        assert_eq!(sliding.sliding_expiration, Some(Duration::from_secs(30)));
    }
}
