//! Request policies.
//!
//! A policy describes how often, how far apart, how many times and for how
//! long a subscriber wants location updates.

use serde::{Deserialize, Serialize};

/// Default requested update interval (one hour).
pub const DEFAULT_INTERVAL_MS: u64 = 3_600_000;

/// Default fastest accepted update interval (ten minutes).
pub const DEFAULT_FASTEST_INTERVAL_MS: u64 = 600_000;

/// Accuracy/power trade-off requested by a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Most precise fix available; uses fine sources when permitted.
    HighAccuracy,
    /// Block-level precision from coarse sources.
    #[default]
    Balanced,
    /// City-level precision from coarse sources.
    LowPower,
    /// Never powers up a source on its own.
    Passive,
}

/// Update policy for a single subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPolicy {
    /// Desired update interval. Drives the source configuration.
    pub interval_ms: u64,
    /// Minimum time between two dispatched samples.
    pub fastest_interval_ms: u64,
    /// Minimum distance between two dispatched samples.
    pub smallest_displacement_m: f64,
    /// Number of dispatches after which the request completes.
    pub max_update_count: Option<u32>,
    /// Accuracy/power hint.
    pub quality: Quality,
    /// Absolute expiration time in milliseconds since the Unix epoch.
    pub expires_at_ms: Option<u64>,
    /// If set, a last known sample at most this old is delivered on subscribe.
    pub max_update_age_ms: Option<u64>,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            fastest_interval_ms: DEFAULT_FASTEST_INTERVAL_MS,
            smallest_displacement_m: 0.0,
            max_update_count: None,
            quality: Quality::Balanced,
            expires_at_ms: None,
            max_update_age_ms: None,
        }
    }
}

impl RequestPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_fastest_interval(mut self, fastest_interval_ms: u64) -> Self {
        self.fastest_interval_ms = fastest_interval_ms;
        self
    }

    #[must_use]
    pub fn with_smallest_displacement(mut self, meters: f64) -> Self {
        self.smallest_displacement_m = meters;
        self
    }

    #[must_use]
    pub fn with_max_updates(mut self, count: u32) -> Self {
        self.max_update_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    #[must_use]
    pub fn with_max_update_age(mut self, age_ms: u64) -> Self {
        self.max_update_age_ms = Some(age_ms);
        self
    }

    /// Validate the policy.
    ///
    /// # Errors
    ///
    /// Returns an error message if a field is out of range.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.smallest_displacement_m.is_finite() || self.smallest_displacement_m < 0.0 {
            return Err("Smallest displacement must be a non-negative number");
        }
        if self.max_update_count == Some(0) {
            return Err("Max update count must be at least 1");
        }
        Ok(())
    }

    /// The throttle interval actually applied.
    ///
    /// A fastest interval above the requested interval is clamped to it.
    #[must_use]
    pub fn effective_fastest_interval_ms(&self) -> u64 {
        self.fastest_interval_ms.min(self.interval_ms)
    }

    /// Check whether the policy has expired at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    /// Check whether `dispatched` updates complete the policy.
    #[must_use]
    pub fn is_complete(&self, dispatched: u32) -> bool {
        self.max_update_count.is_some_and(|max| dispatched >= max)
    }

    /// Updates still owed after `dispatched`, `None` if unbounded.
    #[must_use]
    pub fn remaining(&self, dispatched: u32) -> Option<u32> {
        self.max_update_count.map(|max| max.saturating_sub(dispatched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RequestPolicy::default();
        assert_eq!(policy.interval_ms, 3_600_000);
        assert_eq!(policy.fastest_interval_ms, 600_000);
        assert_eq!(policy.quality, Quality::Balanced);
        assert!(policy.max_update_count.is_none());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_validation() {
        assert!(RequestPolicy::new().with_smallest_displacement(-1.0).validate().is_err());
        assert!(RequestPolicy::new()
            .with_smallest_displacement(f64::NAN)
            .validate()
            .is_err());
        assert!(RequestPolicy::new().with_max_updates(0).validate().is_err());
        assert!(RequestPolicy::new().with_max_updates(1).validate().is_ok());
    }

    #[test]
    fn test_fastest_interval_is_clamped() {
        let policy = RequestPolicy::new()
            .with_interval(1_000)
            .with_fastest_interval(5_000);
        assert_eq!(policy.effective_fastest_interval_ms(), 1_000);
    }

    #[test]
    fn test_expiration_and_completion() {
        let policy = RequestPolicy::new().with_expiration(10_000).with_max_updates(3);

        assert!(!policy.is_expired(9_999));
        assert!(policy.is_expired(10_000));

        assert!(!policy.is_complete(2));
        assert!(policy.is_complete(3));
        assert_eq!(policy.remaining(1), Some(2));
        assert_eq!(RequestPolicy::new().remaining(100), None);
    }

    #[test]
    fn test_quality_serde() {
        let json = serde_json::to_string(&Quality::HighAccuracy).unwrap();
        assert_eq!(json, "\"high_accuracy\"");
    }
}
