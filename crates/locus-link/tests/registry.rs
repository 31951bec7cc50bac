//! Connection sharing against a scripted transport.

use async_trait::async_trait;
use locus_link::{
    BindFlags, BindOptions, BindRequest, ConnectionError, ConnectionRegistry, ConnectionState,
    Forwarder, HostInfo, RegistryConfig, ServiceHandle, ServiceKey, Transport, TransportError,
    TransportEvents,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ScriptedTransport {
    hosts: Mutex<Vec<HostInfo>>,
    reject: AtomicBool,
    binds: Mutex<Vec<BindRequest>>,
    unbinds: Mutex<Vec<ServiceKey>>,
    events: Mutex<Vec<TransportEvents>>,
}

impl ScriptedTransport {
    fn with_hosts(hosts: Vec<HostInfo>) -> Arc<Self> {
        let transport = Self::default();
        *transport.hosts.lock() = hosts;
        Arc::new(transport)
    }

    fn bind_count(&self) -> usize {
        self.binds.lock().len()
    }

    fn unbind_count(&self) -> usize {
        self.unbinds.lock().len()
    }

    fn last_events(&self) -> TransportEvents {
        self.events.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn hosts(&self, _key: &ServiceKey) -> Vec<HostInfo> {
        self.hosts.lock().clone()
    }

    async fn bind(&self, request: BindRequest, events: TransportEvents) -> Result<(), TransportError> {
        self.binds.lock().push(request);
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("permission denied".into()));
        }
        self.events.lock().push(events);
        Ok(())
    }

    async fn unbind(&self, key: &ServiceKey) {
        self.unbinds.lock().push(key.clone());
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected,
    Disconnected,
    Failed(ConnectionError),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }
}

impl Forwarder for Recorder {
    fn on_connected(&self, _key: &ServiceKey, _handle: &ServiceHandle) {
        self.0.lock().push(Event::Connected);
    }

    fn on_disconnected(&self, _key: &ServiceKey) {
        self.0.lock().push(Event::Disconnected);
    }

    fn on_failed(&self, _key: &ServiceKey, error: &ConnectionError) {
        self.0.lock().push(Event::Failed(error.clone()));
    }
}

fn forwarder() -> (Arc<Recorder>, Arc<dyn Forwarder>) {
    let recorder = Arc::new(Recorder::default());
    let handle: Arc<dyn Forwarder> = recorder.clone();
    (recorder, handle)
}

fn setup() -> (Arc<ConnectionRegistry>, Arc<ScriptedTransport>) {
    let transport = ScriptedTransport::with_hosts(vec![HostInfo::new("primary", true)]);
    let registry = ConnectionRegistry::new(transport.clone());
    (registry, transport)
}

fn key() -> ServiceKey {
    ServiceKey::new("locus.location")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_connection_for_concurrent_binders() {
    let (registry, transport) = setup();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let (_, fwd) = forwarder();
                assert!(registry.bind(&key(), fwd.clone()).await);
                fwd
            })
        })
        .collect();
    let mut forwarders = Vec::new();
    for task in tasks {
        forwarders.push(task.await.unwrap());
    }

    assert_eq!(transport.bind_count(), 1);
    assert_eq!(registry.forwarder_count(&key()).await, 16);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Binding));

    for fwd in &forwarders {
        assert!(registry.unbind(&key(), fwd).await);
    }
    assert_eq!(transport.unbind_count(), 1);
    assert!(registry.state(&key()).await.is_none());
}

#[tokio::test]
async fn test_reference_counting() {
    let (registry, transport) = setup();
    let (_, a) = forwarder();
    let (_, b) = forwarder();
    let (_, c) = forwarder();

    for fwd in [&a, &b, &c] {
        registry.bind(&key(), fwd.clone()).await;
    }
    transport
        .last_events()
        .connected(ServiceHandle::new("binder"))
        .await;

    assert!(registry.unbind(&key(), &a).await);
    assert!(registry.unbind(&key(), &b).await);
    assert_eq!(transport.unbind_count(), 0);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Bound));

    assert!(registry.unbind(&key(), &c).await);
    assert_eq!(transport.unbind_count(), 1);
    assert!(registry.state(&key()).await.is_none());

    // Already gone
    assert!(!registry.unbind(&key(), &c).await);
    assert_eq!(transport.unbind_count(), 1);
}

#[tokio::test]
async fn test_late_joiner_replay() {
    let (registry, transport) = setup();
    let (first, first_fwd) = forwarder();
    registry.bind(&key(), first_fwd).await;

    let handle = ServiceHandle::new(7u32);
    assert!(transport.last_events().connected(handle.clone()).await);
    assert_eq!(first.events(), vec![Event::Connected]);

    let (late, late_fwd) = forwarder();
    assert!(registry.bind(&key(), late_fwd).await);
    assert_eq!(late.events(), vec![Event::Connected]);
    assert_eq!(first.events(), vec![Event::Connected]);
    assert_eq!(transport.bind_count(), 1);

    let bound = registry.handle(&key()).await.unwrap();
    assert!(bound.ptr_eq(&handle));
    assert_eq!(bound.downcast_ref::<u32>(), Some(&7));
}

#[tokio::test]
async fn test_rejected_bind_broadcasts_error() {
    let (registry, transport) = setup();
    transport.reject.store(true, Ordering::SeqCst);
    let (rec, fwd) = forwarder();

    assert!(!registry.bind(&key(), fwd.clone()).await);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Error));
    assert!(matches!(
        rec.events().as_slice(),
        [Event::Failed(ConnectionError::BindFailed(_))]
    ));

    // Nothing is bound, so nothing is released.
    assert!(registry.unbind(&key(), &fwd).await);
    assert_eq!(transport.unbind_count(), 0);
}

#[tokio::test]
async fn test_async_failure_reaches_every_forwarder() {
    let (registry, transport) = setup();
    let (a, a_fwd) = forwarder();
    let (b, b_fwd) = forwarder();
    registry.bind(&key(), a_fwd).await;
    registry.bind(&key(), b_fwd).await;

    let events = transport.last_events();
    assert!(events.failed(TransportError::Unavailable("primary".into())).await);

    for rec in [&a, &b] {
        assert!(matches!(
            rec.events().as_slice(),
            [Event::Failed(ConnectionError::BindFailed(_))]
        ));
    }
    // No automatic retry.
    assert_eq!(transport.bind_count(), 1);
    assert!(!events.connected(ServiceHandle::new(())).await);

    // A new forwarder on a failed connection starts a fresh bind.
    let (_, c_fwd) = forwarder();
    assert!(registry.bind(&key(), c_fwd).await);
    assert_eq!(transport.bind_count(), 2);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Binding));
}

#[tokio::test]
async fn test_no_target() {
    let transport = ScriptedTransport::with_hosts(Vec::new());
    let registry = ConnectionRegistry::new(transport.clone());
    let (rec, fwd) = forwarder();

    assert!(!registry.bind(&key(), fwd).await);
    assert_eq!(transport.bind_count(), 0);
    assert_eq!(
        rec.events(),
        vec![Event::Failed(ConnectionError::NoTarget(key()))]
    );
}

#[tokio::test]
async fn test_stale_events_after_rebind() {
    let (registry, transport) = setup();
    let (_, first) = forwarder();
    registry.bind(&key(), first.clone()).await;
    let stale = transport.last_events();
    registry.unbind(&key(), &first).await;

    let (rec, second) = forwarder();
    registry.bind(&key(), second).await;
    let fresh = transport.last_events();
    assert!(fresh.generation() > stale.generation());

    assert!(!stale.connected(ServiceHandle::new(())).await);
    assert!(rec.events().is_empty());
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Binding));

    assert!(fresh.connected(ServiceHandle::new(())).await);
    assert_eq!(rec.events(), vec![Event::Connected]);
}

#[tokio::test]
async fn test_leaver_is_told_disconnected() {
    let (registry, transport) = setup();
    let (leaver, leaver_fwd) = forwarder();
    let (stayer, stayer_fwd) = forwarder();
    registry.bind(&key(), leaver_fwd.clone()).await;
    registry.bind(&key(), stayer_fwd).await;
    transport.last_events().connected(ServiceHandle::new(())).await;

    registry.unbind(&key(), &leaver_fwd).await;

    assert_eq!(leaver.events(), vec![Event::Connected, Event::Disconnected]);
    assert_eq!(stayer.events(), vec![Event::Connected]);
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let (registry, transport) = setup();
    let (a, a_fwd) = forwarder();
    registry.bind(&key(), a_fwd).await;
    let events = transport.last_events();
    events.connected(ServiceHandle::new(())).await;

    assert!(events.disconnected().await);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Error));
    assert!(registry.handle(&key()).await.is_none());

    // The lost bind is still outstanding: joining waits for it.
    let (b, b_fwd) = forwarder();
    assert!(registry.bind(&key(), b_fwd).await);
    assert_eq!(transport.bind_count(), 1);
    assert!(b.events().is_empty());

    assert!(events.connected(ServiceHandle::new(())).await);
    assert_eq!(registry.state(&key()).await, Some(ConnectionState::Bound));
    assert_eq!(
        a.events(),
        vec![Event::Connected, Event::Disconnected, Event::Connected]
    );
    assert_eq!(b.events(), vec![Event::Connected]);
}

#[tokio::test]
async fn test_bind_flags_and_trusted_host() {
    let transport = ScriptedTransport::with_hosts(vec![
        HostInfo::new("primary", false),
        HostInfo::new("secondary", true),
    ]);
    let registry = ConnectionRegistry::with_config(
        transport.clone(),
        RegistryConfig {
            host_preference: vec!["primary".into(), "secondary".into()],
            fallback_host: None,
        },
    );
    let (_, fwd) = forwarder();

    registry
        .bind_with(&key(), fwd, BindOptions::default().require_trusted())
        .await;

    let request = transport.binds.lock()[0].clone();
    assert_eq!(request.host, "secondary");
    assert!(request.flags.contains(BindFlags::AUTO_CREATE));
    assert!(request.flags.contains(BindFlags::DEBUG_UNBIND));
    assert!(request.flags.contains(BindFlags::ADJUST_WITH_ACTIVITY));
    assert_eq!(
        request.flags,
        BindFlags::AUTO_CREATE | BindFlags::DEBUG_UNBIND | BindFlags::ADJUST_WITH_ACTIVITY
    );
}

#[tokio::test]
async fn test_keys_are_independent() {
    let (registry, transport) = setup();
    let (_, fwd) = forwarder();
    let other = ServiceKey::new("locus.geocoder");

    registry.bind(&key(), fwd.clone()).await;
    registry.bind(&other, fwd.clone()).await;
    assert_eq!(transport.bind_count(), 2);

    registry.unbind(&key(), &fwd).await;
    assert_eq!(registry.state(&other).await, Some(ConnectionState::Binding));

    let stats = registry.stats().await;
    assert_eq!(stats.connection_count, 1);
    assert_eq!(stats.forwarder_count, 1);
}

#[tokio::test]
async fn test_stats() {
    let (registry, transport) = setup();
    let (_, a) = forwarder();
    let (_, b) = forwarder();
    registry.bind(&key(), a).await;
    registry.bind(&key(), b).await;
    transport.last_events().connected(ServiceHandle::new(())).await;

    let stats = registry.stats().await;
    assert_eq!(stats.connection_count, 1);
    assert_eq!(stats.forwarder_count, 2);
    assert_eq!(stats.bound_count, 1);
    assert_eq!(stats.error_count, 0);
}
