//! End-to-end behavior of the fusion engine against scripted sources.

use locus_core::{
    AccessTier, AccuracyClass, AllowAll, CallerId, DeliveryError, FusionEngine, LocationListener,
    LocationSample, LocationSource, ProviderSelector, Quality, Receiver, RequestPolicy, SampleSink,
    SourceError, StaticAuthorization, StatusUpdate, StreamParams, Tier, EARTH_RADIUS_M,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;

#[derive(Default)]
struct ScriptedSource {
    started: Mutex<Vec<StreamParams>>,
    stops: Mutex<usize>,
    sink: Mutex<Option<SampleSink>>,
}

impl ScriptedSource {
    fn emit(&self, sample: LocationSample) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.push(sample);
        }
    }

    fn running(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl LocationSource for ScriptedSource {
    fn start(&self, params: StreamParams, sink: SampleSink) -> Result<(), SourceError> {
        self.started.lock().push(params);
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        *self.stops.lock() += 1;
        *self.sink.lock() = None;
    }
}

struct Failing;

impl LocationListener for Failing {
    fn on_location_changed(&self, _sample: &LocationSample) -> Result<(), DeliveryError> {
        Err(DeliveryError::ReceiverGone)
    }
}

/// Unsubscribes its own request from inside the first delivery.
struct SelfCanceling {
    engine: Weak<FusionEngine>,
    request: OnceLock<locus_core::RequestId>,
    seen: Mutex<Vec<LocationSample>>,
}

impl LocationListener for SelfCanceling {
    fn on_location_changed(&self, sample: &LocationSample) -> Result<(), DeliveryError> {
        self.seen.lock().push(*sample);
        if let (Some(engine), Some(id)) = (self.engine.upgrade(), self.request.get()) {
            engine.unsubscribe(*id);
        }
        Ok(())
    }
}

fn setup() -> (Arc<FusionEngine>, Arc<ScriptedSource>, Arc<ScriptedSource>) {
    let engine = FusionEngine::new(Arc::new(AllowAll));
    let gps = Arc::new(ScriptedSource::default());
    let network = Arc::new(ScriptedSource::default());
    engine
        .register_provider("gps", AccuracyClass::Fine, gps.clone())
        .unwrap();
    engine
        .register_provider("network", AccuracyClass::Coarse, network.clone())
        .unwrap();
    (engine, gps, network)
}

fn caller() -> CallerId {
    CallerId::new("com.example.maps")
}

fn at(latitude: f64, timestamp_ms: u64) -> LocationSample {
    LocationSample::new(latitude, 13.0, 5.0, timestamp_ms)
}

fn north_of(origin: &LocationSample, meters: f64, timestamp_ms: u64) -> LocationSample {
    let degrees = meters / (EARTH_RADIUS_M * std::f64::consts::PI / 180.0);
    LocationSample::new(origin.latitude + degrees, origin.longitude, 5.0, timestamp_ms)
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

#[test]
fn test_time_throttle() {
    let (engine, gps, _) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new().with_fastest_interval(5_000),
            Receiver::listener(tx),
        )
        .unwrap();

    let first = at(52.0, 0);
    gps.emit(first);
    gps.emit(at(52.1, 2_000));
    assert_eq!(drain(&mut rx), vec![first]);

    let third = at(52.2, 6_000);
    gps.emit(third);
    assert_eq!(drain(&mut rx), vec![third]);
}

#[test]
fn test_distance_throttle_against_last_dispatched() {
    let (engine, gps, _) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new()
                .with_fastest_interval(0)
                .with_smallest_displacement(50.0),
            Receiver::listener(tx),
        )
        .unwrap();

    let origin = at(52.0, 0);
    gps.emit(origin);
    for (i, step) in [10.0, 20.0, 30.0, 40.0].into_iter().enumerate() {
        gps.emit(north_of(&origin, step, (i as u64 + 1) * 1_000));
    }
    assert_eq!(drain(&mut rx), vec![origin]);

    let far = north_of(&origin, 60.0, 5_000);
    gps.emit(far);
    assert_eq!(drain(&mut rx), vec![far]);
}

#[test]
fn test_count_completion() {
    let (engine, gps, _) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
    let helper = engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new().with_fastest_interval(0).with_max_updates(3),
            Receiver::status_callback(tx),
        )
        .unwrap();

    for i in 0..5u64 {
        gps.emit(at(52.0 + i as f64 * 0.01, i * 1_000));
    }

    let updates = drain(&mut rx);
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[2].delivered, 3);
    assert_eq!(updates[2].remaining, Some(0));
    assert!(!helper.is_active());
    assert!(engine.request(helper.id()).is_none());
    assert!(!gps.running());
}

#[test]
fn test_dead_receiver_isolation() {
    let (engine, gps, _) = setup();
    let dead = engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new(),
            Receiver::listener(Failing),
        )
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .subscribe(
            &CallerId::new("com.example.fitness"),
            ProviderSelector::named("gps"),
            RequestPolicy::new(),
            Receiver::listener(tx),
        )
        .unwrap();

    let sample = at(52.0, 0);
    let report = engine.on_raw_sample("gps", sample);

    assert_eq!(report.delivered, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(drain(&mut rx), vec![sample]);
    assert!(engine.request(dead.id()).is_none());
    assert_eq!(engine.stats().request_count, 1);
}

#[test]
fn test_mock_override() {
    let auth = StaticAuthorization::new()
        .grant("com.example.maps", [Tier::Fine, Tier::Coarse])
        .grant("com.example.tester", [Tier::Mock]);
    let engine = FusionEngine::new(Arc::new(auth));
    let gps = Arc::new(ScriptedSource::default());
    engine
        .register_provider("gps", AccuracyClass::Fine, gps.clone())
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new().with_fastest_interval(0),
            Receiver::listener(tx),
        )
        .unwrap();

    let tester = CallerId::new("com.example.tester");
    let synthetic = LocationSample::new(40.7128, -74.0060, 1.0, 10);
    assert!(engine.set_mock_mode(&tester, true));
    assert!(engine.set_mock_location(&tester, synthetic));
    assert_eq!(drain(&mut rx), vec![synthetic]);

    gps.emit(at(52.0, 20));
    assert!(drain(&mut rx).is_empty());
    assert_eq!(engine.last_location(AccessTier::Fine), Some(synthetic));
    assert_eq!(engine.last_location_for(&caller()), Some(synthetic));

    assert!(engine.set_mock_mode(&tester, false));
    assert!(engine.mock_state().sample().is_none());
    assert_eq!(engine.last_location(AccessTier::Fine), Some(at(52.0, 20)));

    let real = at(52.1, 30);
    gps.emit(real);
    assert_eq!(drain(&mut rx), vec![real]);
}

#[test]
fn test_aggregate_parameters_follow_requests() {
    let (engine, gps, network) = setup();
    let (a, _rx_a) = mpsc::unbounded_channel();
    let (b, _rx_b) = mpsc::unbounded_channel();

    let slow = engine
        .subscribe(
            &caller(),
            ProviderSelector::Fused,
            RequestPolicy::new()
                .with_interval(60_000)
                .with_smallest_displacement(100.0)
                .with_quality(Quality::HighAccuracy),
            Receiver::listener(a),
        )
        .unwrap();
    let fast = engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new()
                .with_interval(1_000)
                .with_smallest_displacement(10.0),
            Receiver::listener(b),
        )
        .unwrap();

    assert_eq!(
        gps.started.lock().last().copied(),
        Some(StreamParams {
            interval_ms: 1_000,
            displacement_m: 10.0
        })
    );
    assert_eq!(network.started.lock().len(), 1);

    engine.unsubscribe(fast.id());
    assert_eq!(
        gps.started.lock().last().copied(),
        Some(StreamParams {
            interval_ms: 60_000,
            displacement_m: 100.0
        })
    );

    engine.unsubscribe(slow.id());
    assert!(!gps.running());
    assert!(!network.running());
    assert_eq!(*gps.stops.lock(), 3);
}

#[test]
fn test_unsubscribe_from_inside_delivery() {
    let (engine, gps, _) = setup();
    let listener = Arc::new(SelfCanceling {
        engine: Arc::downgrade(&engine),
        request: OnceLock::new(),
        seen: Mutex::new(Vec::new()),
    });
    let helper = engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new().with_fastest_interval(0),
            Receiver::Listener(listener.clone()),
        )
        .unwrap();
    listener.request.set(helper.id()).unwrap();

    gps.emit(at(52.0, 0));
    gps.emit(at(52.1, 1_000));

    assert_eq!(listener.seen.lock().len(), 1);
    assert!(!helper.is_active());
    assert!(!gps.running());
}

#[test]
fn test_unsubscribe_twice_is_noop() {
    let (engine, gps, _) = setup();
    let (tx, _rx) = mpsc::unbounded_channel();
    let helper = engine
        .subscribe(
            &caller(),
            ProviderSelector::named("gps"),
            RequestPolicy::new(),
            Receiver::listener(tx),
        )
        .unwrap();

    assert!(engine.unsubscribe(helper.id()));
    assert!(!engine.unsubscribe(helper.id()));
    assert_eq!(*gps.stops.lock(), 1);
}

#[test]
fn test_concurrent_subscribers_and_samples() {
    let (engine, gps, _) = setup();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let (tx, rx) = mpsc::unbounded_channel();
                let helper = engine
                    .subscribe(
                        &CallerId::new(format!("app-{i}")),
                        ProviderSelector::named("gps"),
                        RequestPolicy::new().with_fastest_interval(0),
                        Receiver::listener(tx),
                    )
                    .unwrap();
                (helper, rx)
            })
        })
        .collect();
    let subscribed: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let emitter = {
        let gps = gps.clone();
        std::thread::spawn(move || {
            for ts in 0..50u64 {
                gps.emit(at(52.0 + ts as f64 * 0.001, ts * 10));
            }
        })
    };
    emitter.join().unwrap();

    for (helper, mut rx) in subscribed {
        let samples = drain(&mut rx);
        assert_eq!(samples.len(), 50);
        assert!(samples.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert!(engine.unsubscribe(helper.id()));
    }
    assert!(!gps.running());
}
