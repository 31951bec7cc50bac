//! Caller authorization for Locus.
//!
//! Callers hold tiers that gate which location precision they may receive
//! and whether they may drive the mock provider. Denials are never errors:
//! a denied caller simply sees fewer (or no) samples.

use crate::provider::AccuracyClass;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// An authorization tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Precise location.
    Fine,
    /// Approximate location.
    Coarse,
    /// Control of the mock provider.
    Mock,
}

/// Identity of a calling component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerId(pub String);

impl CallerId {
    /// Create a new caller ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Capability check consulted before honoring a request.
pub trait Authorization: Send + Sync {
    /// Check whether `caller` holds `tier`.
    fn has_tier(&self, caller: &CallerId, tier: Tier) -> bool;
}

/// Location precision a caller is entitled to.
///
/// Ordered from least to most precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    None,
    Coarse,
    Fine,
}

impl AccessTier {
    /// Resolve the access tier of a caller. Fine access implies coarse access.
    #[must_use]
    pub fn resolve(auth: &dyn Authorization, caller: &CallerId) -> Self {
        if auth.has_tier(caller, Tier::Fine) {
            AccessTier::Fine
        } else if auth.has_tier(caller, Tier::Coarse) {
            AccessTier::Coarse
        } else {
            AccessTier::None
        }
    }

    /// Check whether this tier may receive samples of the given class.
    #[must_use]
    pub fn permits(self, class: AccuracyClass) -> bool {
        match class {
            AccuracyClass::Fine => self == AccessTier::Fine,
            AccuracyClass::Coarse => self >= AccessTier::Coarse,
        }
    }
}

/// Grants every tier to every caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn has_tier(&self, _caller: &CallerId, _tier: Tier) -> bool {
        true
    }
}

/// A fixed table of per-caller grants with a fallback for unknown callers.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorization {
    grants: HashMap<CallerId, HashSet<Tier>>,
    default_tiers: HashSet<Tier>,
}

impl StaticAuthorization {
    /// Create an empty table that denies everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant tiers to a caller, replacing any previous grant.
    #[must_use]
    pub fn grant(mut self, caller: impl Into<CallerId>, tiers: impl IntoIterator<Item = Tier>) -> Self {
        self.grants.insert(caller.into(), tiers.into_iter().collect());
        self
    }

    /// Tiers held by callers without an explicit grant.
    #[must_use]
    pub fn with_default_tiers(mut self, tiers: impl IntoIterator<Item = Tier>) -> Self {
        self.default_tiers = tiers.into_iter().collect();
        self
    }
}

impl Authorization for StaticAuthorization {
    fn has_tier(&self, caller: &CallerId, tier: Tier) -> bool {
        self.grants
            .get(caller)
            .unwrap_or(&self.default_tiers)
            .contains(&tier)
    }
}
