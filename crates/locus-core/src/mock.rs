//! Mock location override.
//!
//! While armed with a sample, the mock override preempts every real
//! provider: last-location queries and dispatch use only the synthetic
//! sample.

use crate::sample::LocationSample;
use serde::Serialize;
use tracing::info;

/// Synthetic location state.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MockOverride {
    armed: bool,
    sample: Option<LocationSample>,
}

impl MockOverride {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The stored synthetic sample, armed or not.
    #[must_use]
    pub fn sample(&self) -> Option<LocationSample> {
        self.sample
    }

    /// The sample that overrides real providers, if any.
    #[must_use]
    pub fn active_sample(&self) -> Option<LocationSample> {
        if self.armed {
            self.sample
        } else {
            None
        }
    }

    /// Arm the override.
    pub fn arm(&mut self) {
        if !self.armed {
            info!("Mock location armed");
        }
        self.armed = true;
    }

    /// Disarm the override and forget the synthetic sample.
    pub fn disarm(&mut self) {
        if self.armed {
            info!("Mock location disarmed");
        }
        self.armed = false;
        self.sample = None;
    }

    /// Store a synthetic sample. Invalid samples are rejected.
    pub fn set_sample(&mut self, sample: LocationSample) -> bool {
        if !sample.is_valid() {
            return false;
        }
        self.sample = Some(sample);
        true
    }
}
