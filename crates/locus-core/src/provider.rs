//! Location providers.
//!
//! A provider is a named physical source of samples ("gps", "network", ...).
//! Its state tracks enablement, the last known sample and the requests
//! attached to it. The underlying source runs only while requests are
//! attached, configured with the tightest interval and displacement among
//! them.

use crate::engine::{DispatchReport, FusionEngine};
use crate::policy::Quality;
use crate::request::{RequestHelper, RequestId};
use crate::sample::LocationSample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum provider name length.
pub const MAX_PROVIDER_NAME_LENGTH: usize = 64;

/// Name reserved for the synthetic provider.
pub const MOCK_PROVIDER: &str = "mock";

/// Validate a provider name.
///
/// # Errors
///
/// Returns an error message if the provider name is invalid.
pub fn validate_provider_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Provider name cannot be empty");
    }
    if name.len() > MAX_PROVIDER_NAME_LENGTH {
        return Err("Provider name too long");
    }
    if name == MOCK_PROVIDER {
        return Err("Provider name 'mock' is reserved");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err("Provider name contains invalid characters");
    }
    Ok(())
}

/// Precision class of a provider. Ordered tightest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyClass {
    /// Satellite-grade fixes.
    Fine,
    /// Network-derived fixes.
    Coarse,
}

/// Parameters a source is started with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    pub interval_ms: u64,
    pub displacement_m: f64,
}

/// Source errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be started.
    #[error("Source failed to start: {0}")]
    StartFailed(String),
}

/// A physical source of location samples.
///
/// `start` must not push samples into the sink synchronously; samples are
/// delivered later from the source's own context, in non-decreasing
/// timestamp order.
pub trait LocationSource: Send + Sync {
    /// Start producing samples into `sink`.
    fn start(&self, params: StreamParams, sink: SampleSink) -> Result<(), SourceError>;

    /// Stop producing samples.
    fn stop(&self);
}

/// Handle a source pushes raw samples through.
#[derive(Clone)]
pub struct SampleSink {
    provider: Arc<str>,
    engine: Weak<FusionEngine>,
}

impl SampleSink {
    pub(crate) fn new(provider: Arc<str>, engine: Weak<FusionEngine>) -> Self {
        Self { provider, engine }
    }

    /// Name of the provider this sink feeds.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Push a raw sample. Returns `None` once the engine is gone.
    pub fn push(&self, sample: LocationSample) -> Option<DispatchReport> {
        let engine = self.engine.upgrade()?;
        Some(engine.on_raw_sample(&self.provider, sample))
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// State of a single provider.
#[derive(Debug)]
pub struct ProviderState {
    name: String,
    class: AccuracyClass,
    enabled: bool,
    last_known: Option<LocationSample>,
    active: BTreeMap<RequestId, Arc<RequestHelper>>,
}

impl ProviderState {
    /// Create an enabled provider with no requests.
    #[must_use]
    pub fn new(name: impl Into<String>, class: AccuracyClass) -> Self {
        Self {
            name: name.into(),
            class,
            enabled: true,
            last_known: None,
            active: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn class(&self) -> AccuracyClass {
        self.class
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn last_known(&self) -> Option<LocationSample> {
        self.last_known
    }

    /// Record a new raw sample as the last known location.
    pub fn record(&mut self, sample: LocationSample) {
        self.last_known = Some(sample);
    }

    /// Attach a request. Returns `true` if it was not attached yet.
    pub fn attach(&mut self, helper: Arc<RequestHelper>) -> bool {
        let id = helper.id();
        let added = self.active.insert(id, helper).is_none();
        if added {
            debug!(provider = %self.name, request = %id, "Request attached");
        }
        added
    }

    /// Detach a request. Returns `true` if it was attached.
    pub fn detach(&mut self, id: RequestId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            debug!(provider = %self.name, request = %id, "Request detached");
        }
        removed
    }

    #[must_use]
    pub fn is_attached(&self, id: RequestId) -> bool {
        self.active.contains_key(&id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Copy of the attached requests, safe to iterate while they detach.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<RequestHelper>> {
        self.active.values().cloned().collect()
    }

    /// Parameters the source should run with, `None` if it should be stopped.
    ///
    /// Passive requests receive samples but never shape the stream.
    #[must_use]
    pub fn desired_params(&self) -> Option<StreamParams> {
        if !self.enabled {
            return None;
        }
        let driving = || {
            self.active
                .values()
                .filter(|h| h.policy().quality != Quality::Passive)
        };
        let interval_ms = driving().map(|h| h.policy().interval_ms).min()?;
        let displacement_m = driving()
            .map(|h| h.policy().smallest_displacement_m)
            .fold(f64::INFINITY, f64::min);
        Some(StreamParams {
            interval_ms,
            displacement_m,
        })
    }
}

/// What the source was last configured with.
#[derive(Debug, Default)]
pub(crate) struct StreamControl {
    pub(crate) configured: Option<StreamParams>,
}

/// A registered provider: its state, its source and the source's configuration.
///
/// Lock order is `stream` before `state`. Sample delivery only takes `state`.
pub(crate) struct ProviderSlot {
    pub(crate) name: Arc<str>,
    pub(crate) class: AccuracyClass,
    pub(crate) state: Mutex<ProviderState>,
    pub(crate) stream: Mutex<StreamControl>,
    pub(crate) source: Arc<dyn LocationSource>,
}

impl ProviderSlot {
    pub(crate) fn new(name: &str, class: AccuracyClass, source: Arc<dyn LocationSource>) -> Self {
        Self {
            name: Arc::from(name),
            class,
            state: Mutex::new(ProviderState::new(name, class)),
            stream: Mutex::new(StreamControl::default()),
            source,
        }
    }

    /// Bring the source in line with the attached requests.
    ///
    /// Restarts the source whenever the aggregate parameters change.
    pub(crate) fn reconcile(&self, sink: SampleSink) {
        let mut stream = self.stream.lock();
        let desired = self.state.lock().desired_params();
        if desired == stream.configured {
            return;
        }

        if let Some(previous) = stream.configured.take() {
            self.source.stop();
            debug!(provider = %self.name, ?previous, "Source stopped");
        }

        if let Some(params) = desired {
            match self.source.start(params, sink) {
                Ok(()) => {
                    debug!(
                        provider = %self.name,
                        interval_ms = params.interval_ms,
                        displacement_m = params.displacement_m,
                        "Source started"
                    );
                    stream.configured = Some(params);
                }
                Err(e) => {
                    warn!(provider = %self.name, error = %e, "Source failed to start");
                }
            }
        }
    }

    /// Stop the source unconditionally.
    pub(crate) fn halt(&self) {
        let mut stream = self.stream.lock();
        if stream.configured.take().is_some() {
            self.source.stop();
            debug!(provider = %self.name, "Source halted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RequestPolicy;
    use crate::receiver::Receiver;
    use tokio::sync::mpsc;

    fn helper(interval_ms: u64, displacement_m: f64) -> Arc<RequestHelper> {
        let (tx, _rx) = mpsc::unbounded_channel::<LocationSample>();
        Arc::new(RequestHelper::new(
            "test".into(),
            RequestPolicy::new()
                .with_interval(interval_ms)
                .with_smallest_displacement(displacement_m),
            Receiver::listener(tx),
            vec!["gps".to_string()],
        ))
    }

    #[test]
    fn test_provider_name_validation() {
        assert!(validate_provider_name("gps").is_ok());
        assert!(validate_provider_name("wifi_scan-2").is_ok());
        assert!(validate_provider_name("").is_err());
        assert!(validate_provider_name("mock").is_err());
        assert!(validate_provider_name("has space").is_err());
        assert!(validate_provider_name(&"a".repeat(MAX_PROVIDER_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_attach_detach() {
        let mut state = ProviderState::new("gps", AccuracyClass::Fine);
        let a = helper(1_000, 0.0);

        assert!(state.attach(a.clone()));
        assert!(!state.attach(a.clone()));
        assert_eq!(state.active_count(), 1);
        assert!(state.is_attached(a.id()));

        assert!(state.detach(a.id()));
        assert!(!state.detach(a.id()));
        assert!(state.is_empty());
    }

    #[test]
    fn test_desired_params_take_tightest() {
        let mut state = ProviderState::new("gps", AccuracyClass::Fine);
        assert!(state.desired_params().is_none());

        state.attach(helper(10_000, 25.0));
        state.attach(helper(2_000, 100.0));
        state.attach(helper(5_000, 5.0));

        assert_eq!(
            state.desired_params(),
            Some(StreamParams {
                interval_ms: 2_000,
                displacement_m: 5.0
            })
        );
    }

    #[test]
    fn test_passive_requests_do_not_drive_stream() {
        let mut state = ProviderState::new("network", AccuracyClass::Coarse);
        let (tx, _rx) = mpsc::unbounded_channel::<LocationSample>();
        let passive = Arc::new(RequestHelper::new(
            "test".into(),
            RequestPolicy::new()
                .with_interval(100)
                .with_quality(Quality::Passive),
            Receiver::listener(tx),
            vec!["network".to_string()],
        ));

        state.attach(passive);
        assert_eq!(state.active_count(), 1);
        assert!(state.desired_params().is_none());

        state.attach(helper(5_000, 10.0));
        assert_eq!(
            state.desired_params(),
            Some(StreamParams {
                interval_ms: 5_000,
                displacement_m: 10.0
            })
        );
    }

    #[test]
    fn test_disabled_provider_wants_nothing() {
        let mut state = ProviderState::new("network", AccuracyClass::Coarse);
        state.attach(helper(1_000, 0.0));
        state.set_enabled(false);
        assert!(state.desired_params().is_none());
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let mut state = ProviderState::new("gps", AccuracyClass::Fine);
        let a = helper(1_000, 0.0);
        state.attach(a.clone());

        let snapshot = state.snapshot();
        state.detach(a.id());
        assert_eq!(snapshot.len(), 1);
        assert!(state.is_empty());
    }

    #[test]
    fn test_accuracy_class_order() {
        assert!(AccuracyClass::Fine < AccuracyClass::Coarse);
    }
}
