//! The fusion engine.
//!
//! The engine owns the registered providers, the live requests and the mock
//! override. It attaches requests to providers, keeps each provider's source
//! configured for the tightest attached request, and fans raw samples out to
//! the attached requests under their individual policies.

use crate::auth::{AccessTier, Authorization, CallerId, Tier};
use crate::clock::{Clock, SystemClock};
use crate::mock::MockOverride;
use crate::policy::{Quality, RequestPolicy};
use crate::provider::{
    validate_provider_name, AccuracyClass, LocationSource, ProviderSlot, SampleSink, StreamParams,
};
use crate::receiver::Receiver;
use crate::request::{DispatchOutcome, RequestHelper, RequestId};
use crate::sample::LocationSample;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid provider name.
    #[error("Invalid provider name: {0}")]
    InvalidProvider(&'static str),

    /// A provider with this name is already registered.
    #[error("Provider already registered: {0}")]
    ProviderExists(String),

    /// No provider with this name is registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The request policy is out of range.
    #[error("Invalid request policy: {0}")]
    InvalidPolicy(&'static str),

    /// Maximum number of live requests reached.
    #[error("Maximum requests reached")]
    MaxRequestsReached,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of live requests.
    pub max_requests: usize,
    /// How much newer a coarse sample must be to beat a fine one when
    /// answering last-location queries. Zero picks the most recent sample.
    pub fine_preference_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_requests: 10_000,
            fine_preference_window_ms: 0,
        }
    }
}

/// Which providers a subscription attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelector {
    /// Pick providers from the policy's quality hint and the caller's tier.
    Fused,
    /// Exactly the named provider.
    Named(String),
}

impl ProviderSelector {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        ProviderSelector::Named(name.into())
    }
}

/// Outcome of fanning one sample out to a set of requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub throttled: usize,
    pub removed: usize,
}

/// The central location coordinator.
pub struct FusionEngine {
    me: Weak<FusionEngine>,
    /// Providers indexed by name.
    providers: DashMap<String, Arc<ProviderSlot>>,
    /// Live requests indexed by ID.
    requests: DashMap<RequestId, Arc<RequestHelper>>,
    /// Admitted requests, reserved before insertion.
    live: AtomicUsize,
    mock: RwLock<MockOverride>,
    auth: Arc<dyn Authorization>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl std::fmt::Debug for FusionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FusionEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(auth: Arc<dyn Authorization>) -> Arc<Self> {
        Self::with_config(EngineConfig::default(), auth)
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig, auth: Arc<dyn Authorization>) -> Arc<Self> {
        Self::with_clock(config, auth, Arc::new(SystemClock))
    }

    /// Create an engine with custom configuration and clock.
    #[must_use]
    pub fn with_clock(
        config: EngineConfig,
        auth: Arc<dyn Authorization>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        info!("Creating fusion engine with config: {:?}", config);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            providers: DashMap::new(),
            requests: DashMap::new(),
            live: AtomicUsize::new(0),
            mock: RwLock::new(MockOverride::new()),
            auth,
            clock,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a physical location source.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or already taken.
    pub fn register_provider(
        &self,
        name: &str,
        class: AccuracyClass,
        source: Arc<dyn LocationSource>,
    ) -> Result<(), EngineError> {
        validate_provider_name(name).map_err(EngineError::InvalidProvider)?;

        match self.providers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(EngineError::ProviderExists(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(ProviderSlot::new(name, class, source)));
                info!(provider = %name, ?class, "Provider registered");
                Ok(())
            }
        }
    }

    /// Names of all registered providers, sorted.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe a receiver to location updates.
    ///
    /// A caller without a tier permitting any selected provider gets back an
    /// inert request that never receives samples. A receiver that already
    /// owns a request has that request replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is invalid, the named provider does
    /// not exist, or the request limit is reached.
    pub fn subscribe(
        &self,
        caller: &CallerId,
        selector: ProviderSelector,
        policy: RequestPolicy,
        receiver: Receiver,
    ) -> Result<Arc<RequestHelper>, EngineError> {
        policy.validate().map_err(EngineError::InvalidPolicy)?;

        let access = AccessTier::resolve(self.auth.as_ref(), caller);
        let targets = self.select_providers(&selector, access, policy.quality)?;

        let replaced = self.retire_receiver(&receiver, "replaced");
        if replaced > 0 {
            debug!(caller = %caller, replaced, "Replaced existing request for receiver");
        }

        let names = targets.iter().map(|slot| slot.name.to_string()).collect();
        let helper = Arc::new(RequestHelper::new(caller.clone(), policy, receiver, names));

        if targets.is_empty() {
            helper.deactivate();
            debug!(
                caller = %caller,
                request = %helper.id(),
                ?access,
                "No permitted provider, request is inert"
            );
            return Ok(helper);
        }

        let max = self.config.max_requests;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| EngineError::MaxRequestsReached)?;

        self.requests.insert(helper.id(), Arc::clone(&helper));
        for slot in &targets {
            let mut state = slot.state.lock();
            // A concurrent unsubscribe deactivates before detaching.
            if helper.is_active() {
                state.attach(Arc::clone(&helper));
            }
        }
        for slot in &targets {
            self.reconcile(slot);
        }

        debug!(
            caller = %caller,
            request = %helper.id(),
            providers = ?helper.providers(),
            receiver = helper.receiver().kind(),
            "Subscribed"
        );

        if let Some(max_age) = helper.policy().max_update_age_ms {
            self.deliver_initial(&helper, &targets, max_age);
        }

        Ok(helper)
    }

    /// Remove a request. Removing an unknown request is a no-op.
    ///
    /// Returns `true` if the request was live.
    pub fn unsubscribe(&self, id: RequestId) -> bool {
        self.retire(id, "unsubscribed")
    }

    /// Remove every request delivering to `receiver`.
    ///
    /// Returns the number of requests removed.
    pub fn unsubscribe_receiver(&self, receiver: &Receiver) -> usize {
        self.retire_receiver(receiver, "unsubscribed")
    }

    /// Process a raw sample from a provider.
    pub fn on_raw_sample(&self, provider: &str, sample: LocationSample) -> DispatchReport {
        if !sample.is_valid() {
            trace!(provider = %provider, "Dropping invalid sample");
            return DispatchReport::default();
        }
        let Some(slot) = self.slot(provider) else {
            warn!(provider = %provider, "Sample from unknown provider");
            return DispatchReport::default();
        };

        let snapshot = {
            let mut state = slot.state.lock();
            if !state.is_enabled() {
                trace!(provider = %provider, "Provider disabled, sample ignored");
                return DispatchReport::default();
            }
            state.record(sample);
            state.snapshot()
        };

        if self.mock.read().is_armed() {
            trace!(provider = %provider, "Mock armed, raw sample not dispatched");
            return DispatchReport::default();
        }

        let report = self.dispatch(&snapshot, &sample);
        trace!(
            provider = %provider,
            delivered = report.delivered,
            throttled = report.throttled,
            removed = report.removed,
            "Raw sample dispatched"
        );
        report
    }

    /// Best last known location for an access tier.
    ///
    /// While the mock is armed only its sample is visible, even when none has
    /// been set yet. Otherwise the most recent
    /// permitted sample is returned, preferring the fine class on ties.
    #[must_use]
    pub fn last_location(&self, tier: AccessTier) -> Option<LocationSample> {
        {
            let mock = self.mock.read();
            if mock.is_armed() {
                return mock.sample();
            }
        }

        let mut best_fine: Option<LocationSample> = None;
        let mut best_coarse: Option<LocationSample> = None;
        for slot in self.slots() {
            if !tier.permits(slot.class) {
                continue;
            }
            let state = slot.state.lock();
            if !state.is_enabled() {
                continue;
            }
            let Some(sample) = state.last_known() else {
                continue;
            };
            let best = match slot.class {
                AccuracyClass::Fine => &mut best_fine,
                AccuracyClass::Coarse => &mut best_coarse,
            };
            if best.map_or(true, |b| sample.timestamp_ms > b.timestamp_ms) {
                *best = Some(sample);
            }
        }

        match (best_fine, best_coarse) {
            (Some(fine), Some(coarse)) => {
                let window = self.config.fine_preference_window_ms;
                if fine.timestamp_ms.saturating_add(window) >= coarse.timestamp_ms {
                    Some(fine)
                } else {
                    Some(coarse)
                }
            }
            (fine, coarse) => fine.or(coarse),
        }
    }

    /// Best last known location for a caller, resolved through authorization.
    #[must_use]
    pub fn last_location_for(&self, caller: &CallerId) -> Option<LocationSample> {
        self.last_location(AccessTier::resolve(self.auth.as_ref(), caller))
    }

    /// Arm or disarm the mock override. Disarming forgets the mock sample.
    ///
    /// Returns `false` if the caller lacks the mock tier.
    pub fn set_mock_mode(&self, caller: &CallerId, enabled: bool) -> bool {
        if !self.auth.has_tier(caller, Tier::Mock) {
            debug!(caller = %caller, "Mock mode change denied");
            return false;
        }
        let mut mock = self.mock.write();
        if enabled {
            mock.arm();
        } else {
            mock.disarm();
        }
        true
    }

    /// Set the mock sample. While armed it is dispatched to every live request.
    ///
    /// Returns `false` if the caller lacks the mock tier or the sample is invalid.
    pub fn set_mock_location(&self, caller: &CallerId, sample: LocationSample) -> bool {
        if !self.auth.has_tier(caller, Tier::Mock) {
            debug!(caller = %caller, "Mock location change denied");
            return false;
        }
        let armed = {
            let mut mock = self.mock.write();
            if !mock.set_sample(sample) {
                return false;
            }
            mock.is_armed()
        };

        if armed {
            let report = self.dispatch(&self.active_requests(), &sample);
            debug!(
                delivered = report.delivered,
                throttled = report.throttled,
                removed = report.removed,
                "Mock sample dispatched"
            );
        }
        true
    }

    /// Current mock override state.
    #[must_use]
    pub fn mock_state(&self) -> MockOverride {
        self.mock.read().clone()
    }

    /// Enable or disable a provider. A disabled provider's source is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider does not exist.
    pub fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))?;
        slot.state.lock().set_enabled(enabled);
        self.reconcile(&slot);
        info!(provider = %name, enabled, "Provider enablement changed");
        Ok(())
    }

    /// Look up a live request.
    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<Arc<RequestHelper>> {
        self.requests.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// All live requests, ordered by ID.
    #[must_use]
    pub fn active_requests(&self) -> Vec<Arc<RequestHelper>> {
        let mut helpers: Vec<Arc<RequestHelper>> =
            self.requests.iter().map(|e| Arc::clone(e.value())).collect();
        helpers.sort_by_key(|h| h.id());
        helpers
    }

    /// Drop requests whose receiver died or whose policy expired.
    ///
    /// Returns the number of requests removed.
    pub fn verify_requests(&self) -> usize {
        let now = self.clock.now_ms();
        let stale: Vec<(RequestId, &'static str)> = self
            .requests
            .iter()
            .filter_map(|entry| {
                let helper = entry.value();
                if !helper.receiver().is_alive() {
                    Some((helper.id(), "receiver dead"))
                } else if helper.policy().is_expired(now) {
                    Some((helper.id(), "expired"))
                } else {
                    None
                }
            })
            .collect();

        let removed = stale
            .into_iter()
            .filter(|(id, reason)| self.retire(*id, reason))
            .count();
        if removed > 0 {
            debug!(removed, "Pruned inactive requests");
        }
        removed
    }

    /// Remove every request and stop every source.
    pub fn shutdown(&self) {
        let ids: Vec<RequestId> = self.requests.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.retire(id, "shutdown");
        }
        for slot in self.slots() {
            slot.halt();
        }
        info!("Fusion engine shut down");
    }

    /// Get engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let slots = self.slots();
        EngineStats {
            provider_count: slots.len(),
            request_count: self.requests.len(),
            attached_count: slots.iter().map(|s| s.state.lock().active_count()).sum(),
            running_sources: slots
                .iter()
                .filter(|s| s.stream.lock().configured.is_some())
                .count(),
            mock_armed: self.mock.read().is_armed(),
        }
    }

    /// Serializable snapshot of the whole engine.
    #[must_use]
    pub fn dump(&self) -> EngineSnapshot {
        let providers = self
            .slots()
            .iter()
            .map(|slot| {
                let stream = slot.stream.lock().configured;
                let state = slot.state.lock();
                ProviderSnapshot {
                    name: state.name().to_string(),
                    class: state.class(),
                    enabled: state.is_enabled(),
                    last_known: state.last_known(),
                    active_requests: state.active_count(),
                    stream,
                }
            })
            .collect();

        let requests = self
            .active_requests()
            .iter()
            .map(|helper| RequestSnapshot {
                id: helper.id(),
                caller: helper.caller().clone(),
                receiver: helper.receiver().kind(),
                providers: helper.providers().to_vec(),
                policy: helper.policy().clone(),
                dispatched: helper.dispatched_count(),
                last_dispatched: helper.last_dispatched(),
            })
            .collect();

        EngineSnapshot {
            providers,
            requests,
            mock: self.mock_state(),
        }
    }

    fn slot(&self, name: &str) -> Option<Arc<ProviderSlot>> {
        self.providers.get(name).map(|e| Arc::clone(e.value()))
    }

    fn slots(&self) -> Vec<Arc<ProviderSlot>> {
        let mut slots: Vec<Arc<ProviderSlot>> =
            self.providers.iter().map(|e| Arc::clone(e.value())).collect();
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        slots
    }

    fn reconcile(&self, slot: &ProviderSlot) {
        slot.reconcile(SampleSink::new(Arc::clone(&slot.name), self.me.clone()));
    }

    fn select_providers(
        &self,
        selector: &ProviderSelector,
        access: AccessTier,
        quality: Quality,
    ) -> Result<Vec<Arc<ProviderSlot>>, EngineError> {
        match selector {
            ProviderSelector::Named(name) => {
                let slot = self
                    .slot(name)
                    .ok_or_else(|| EngineError::UnknownProvider(name.clone()))?;
                if access.permits(slot.class) {
                    Ok(vec![slot])
                } else {
                    Ok(Vec::new())
                }
            }
            ProviderSelector::Fused => Ok(self
                .slots()
                .into_iter()
                .filter(|slot| access.permits(slot.class) && fused_wants(quality, slot.class))
                .collect()),
        }
    }

    fn deliver_initial(&self, helper: &Arc<RequestHelper>, targets: &[Arc<ProviderSlot>], max_age: u64) {
        let mocked = {
            let mock = self.mock.read();
            mock.is_armed().then(|| mock.sample())
        };
        let candidate = match mocked {
            Some(sample) => sample,
            None => targets
                .iter()
                .filter_map(|slot| {
                    let state = slot.state.lock();
                    state.is_enabled().then(|| state.last_known()).flatten()
                })
                .max_by_key(|sample| sample.timestamp_ms),
        };

        if let Some(sample) = candidate {
            if sample.age_ms(self.clock.now_ms()) <= max_age {
                self.dispatch(std::slice::from_ref(helper), &sample);
            }
        }
    }

    fn dispatch(&self, helpers: &[Arc<RequestHelper>], sample: &LocationSample) -> DispatchReport {
        let now = self.clock.now_ms();
        let mut report = DispatchReport::default();

        for helper in helpers {
            match helper.offer(sample, now) {
                DispatchOutcome::Delivered { completed } => {
                    report.delivered += 1;
                    if completed {
                        report.removed += usize::from(self.retire(helper.id(), "completed"));
                    }
                }
                DispatchOutcome::Throttled(_) => report.throttled += 1,
                DispatchOutcome::Failed(e) => {
                    warn!(
                        request = %helper.id(),
                        caller = %helper.caller(),
                        error = %e,
                        "Receiver unreachable, dropping request"
                    );
                    report.removed += usize::from(self.retire(helper.id(), "receiver gone"));
                }
                DispatchOutcome::Expired => {
                    report.removed += usize::from(self.retire(helper.id(), "expired"));
                }
                DispatchOutcome::Inactive => {}
            }
        }

        report
    }

    fn retire(&self, id: RequestId, reason: &str) -> bool {
        let Some((_, helper)) = self.requests.remove(&id) else {
            return false;
        };
        self.live.fetch_sub(1, Ordering::AcqRel);
        helper.deactivate();

        for name in helper.providers() {
            let slot = self.slot(name);
            debug_assert!(
                slot.is_some(),
                "request {id} attached to unregistered provider {name}"
            );
            let Some(slot) = slot else {
                warn!(request = %id, provider = %name, "Request attached to unregistered provider");
                continue;
            };
            let detached = slot.state.lock().detach(id);
            if detached {
                self.reconcile(&slot);
            }
        }

        debug!(request = %id, caller = %helper.caller(), reason, "Request removed");
        true
    }

    fn retire_receiver(&self, receiver: &Receiver, reason: &str) -> usize {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|e| e.value().receiver().same_endpoint(receiver))
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter(|id| self.retire(*id, reason)).count()
    }
}

/// Whether fused selection attaches a request of `quality` to a provider of `class`.
///
/// Passive requests ride along on every permitted provider.
fn fused_wants(quality: Quality, class: AccuracyClass) -> bool {
    match class {
        AccuracyClass::Fine => matches!(quality, Quality::HighAccuracy | Quality::Passive),
        AccuracyClass::Coarse => true,
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Number of registered providers.
    pub provider_count: usize,
    /// Number of live requests.
    pub request_count: usize,
    /// Total request attachments across providers.
    pub attached_count: usize,
    /// Number of sources currently started.
    pub running_sources: usize,
    /// Whether the mock override is armed.
    pub mock_armed: bool,
}

/// Snapshot of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub class: AccuracyClass,
    pub enabled: bool,
    pub last_known: Option<LocationSample>,
    pub active_requests: usize,
    pub stream: Option<StreamParams>,
}

/// Snapshot of one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub caller: CallerId,
    pub receiver: &'static str,
    pub providers: Vec<String>,
    pub policy: RequestPolicy,
    pub dispatched: u32,
    pub last_dispatched: Option<LocationSample>,
}

/// Snapshot of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub providers: Vec<ProviderSnapshot>,
    pub requests: Vec<RequestSnapshot>,
    pub mock: MockOverride,
}
