//! HTTP and WebSocket handlers for the Locus daemon.
//!
//! WebSocket subscribers are backed by a channel listener: closing the socket
//! drops the channel, and the engine prunes the request once it notices.
//! Sessions reach the engine through the connection registry.

use crate::config::Config;
use crate::link::{LinkEvent, LocalTransport, SessionLink, LOCATION_SERVICE};
use crate::metrics::{self, SubscriberMetricsGuard};
use crate::replay::ReplaySource;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use locus_core::{
    CallerId, FusionEngine, LocationSample, ProviderSelector, Quality, Receiver, RequestPolicy,
};
use locus_link::{ConnectionRegistry, Forwarder, ServiceHandle, ServiceKey};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared daemon state.
pub struct AppState {
    /// The fusion engine.
    pub engine: Arc<FusionEngine>,
    /// Shared connections to in-process services.
    pub registry: Arc<ConnectionRegistry>,
    /// Daemon configuration.
    pub config: Config,
}

impl AppState {
    /// Build the engine and register the configured providers.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider's track cannot be loaded or registered.
    pub fn new(config: Config) -> Result<Self> {
        let engine = FusionEngine::with_config(
            config.engine.engine_config(),
            Arc::new(config.auth.authorization()),
        );

        for provider in &config.providers {
            let source = ReplaySource::from_file(
                &provider.track,
                Duration::from_millis(provider.min_period_ms),
            )?;
            engine
                .register_provider(&provider.name, provider.class, Arc::new(source))
                .with_context(|| format!("Failed to register provider {}", provider.name))?;
        }

        let transport = LocalTransport::new();
        transport.register(
            ServiceKey::new(LOCATION_SERVICE),
            ServiceHandle::new(Arc::clone(&engine)),
        );
        let registry = ConnectionRegistry::new(Arc::new(transport));

        Ok(Self {
            engine,
            registry,
            config,
        })
    }

    /// Build the HTTP router.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/location/last", get(last_location_handler))
            .route("/dump", get(dump_handler))
            .route("/mock", post(mock_handler))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);
    let config = &state.config;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let verifier = tokio::spawn(verify_loop(
        Arc::clone(&state.engine),
        Duration::from_millis(config.engine.verify_interval_ms),
    ));

    let app = state.router();
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Locus daemon listening on {}", addr);
    info!(providers = ?state.engine.provider_names(), "Providers registered");

    let served = axum::serve(listener, app).await;

    verifier.abort();
    state.engine.shutdown();
    served?;
    Ok(())
}

/// Periodically prune dead and expired requests.
async fn verify_loop(engine: Arc<FusionEngine>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let pruned = engine.verify_requests();
        if pruned > 0 {
            metrics::record_pruned(pruned);
        }
        metrics::record_engine_stats(&engine.stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": state.engine.stats(),
        "link": state.registry.stats().await,
    }))
}

#[derive(Debug, Deserialize)]
struct CallerQuery {
    caller: String,
}

/// Last known location for a caller. `null` when nothing is available.
async fn last_location_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallerQuery>,
) -> Json<Option<LocationSample>> {
    Json(state.engine.last_location_for(&CallerId::new(query.caller)))
}

/// Full engine snapshot.
async fn dump_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.dump())
}

#[derive(Debug, Deserialize)]
struct MockRequest {
    caller: String,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    location: Option<LocationSample>,
}

/// Arm, disarm or move the mock location.
async fn mock_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MockRequest>,
) -> Response {
    let caller = CallerId::new(request.caller);

    if let Some(enabled) = request.enabled {
        if !state.engine.set_mock_mode(&caller, enabled) {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    if let Some(location) = request.location {
        if !state.engine.set_mock_location(&caller, location) {
            return (StatusCode::BAD_REQUEST, "Mock location refused").into_response();
        }
    }

    Json(state.engine.mock_state()).into_response()
}

/// Subscription parameters of a WebSocket subscriber.
#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub caller: String,
    /// Named provider; fused selection when absent.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub fastest_interval_ms: Option<u64>,
    #[serde(default)]
    pub smallest_displacement_m: Option<f64>,
    #[serde(default)]
    pub max_updates: Option<u32>,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub max_update_age_ms: Option<u64>,
}

impl SubscribeQuery {
    /// Provider selector for the subscription.
    #[must_use]
    pub fn selector(&self) -> ProviderSelector {
        match &self.provider {
            Some(name) => ProviderSelector::named(name.as_str()),
            None => ProviderSelector::Fused,
        }
    }

    /// Request policy for the subscription.
    #[must_use]
    pub fn policy(&self) -> RequestPolicy {
        let mut policy = RequestPolicy::new();
        if let Some(interval) = self.interval_ms {
            policy = policy.with_interval(interval);
        }
        if let Some(fastest) = self.fastest_interval_ms {
            policy = policy.with_fastest_interval(fastest);
        }
        if let Some(meters) = self.smallest_displacement_m {
            policy = policy.with_smallest_displacement(meters);
        }
        if let Some(count) = self.max_updates {
            policy = policy.with_max_updates(count);
        }
        if let Some(quality) = self.quality {
            policy = policy.with_quality(quality);
        }
        if let Some(age) = self.max_update_age_ms {
            policy = policy.with_max_update_age(age);
        }
        policy
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SubscribeQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, query, state))
}

/// Send an error frame and close the socket.
async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: String) {
    let body = serde_json::json!({ "error": reason }).to_string();
    let _ = sender.send(Message::Text(body)).await;
    let _ = sender.close().await;
}

/// Bind the session to the location service and wait for the engine.
async fn link_engine(
    registry: &ConnectionRegistry,
    key: &ServiceKey,
    link: &Arc<dyn Forwarder>,
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
) -> Result<Arc<FusionEngine>, String> {
    registry.bind(key, Arc::clone(link)).await;
    match events.recv().await {
        Some(LinkEvent::Connected(handle)) => handle
            .downcast_ref::<Arc<FusionEngine>>()
            .cloned()
            .ok_or_else(|| format!("Unexpected service behind {key}")),
        Some(LinkEvent::Failed(e)) => Err(e.to_string()),
        Some(LinkEvent::Disconnected) | None => Err(format!("{key} unavailable")),
    }
}

/// Stream samples to a WebSocket subscriber until either side goes away.
async fn handle_websocket(socket: WebSocket, query: SubscribeQuery, state: Arc<AppState>) {
    let _metrics_guard = SubscriberMetricsGuard::new();
    let caller = CallerId::new(query.caller.as_str());
    let (mut sender, mut receiver) = socket.split();

    let key = ServiceKey::new(LOCATION_SERVICE);
    let (link, mut link_events) = SessionLink::new();
    let link: Arc<dyn Forwarder> = Arc::new(link);

    let engine = match link_engine(&state.registry, &key, &link, &mut link_events).await {
        Ok(engine) => engine,
        Err(reason) => {
            warn!(caller = %caller, error = %reason, "Location service link failed");
            metrics::record_error("link");
            state.registry.unbind(&key, &link).await;
            reject(&mut sender, reason).await;
            return;
        }
    };

    let (tx, mut samples) = mpsc::unbounded_channel::<LocationSample>();
    let helper = match engine.subscribe(
        &caller,
        query.selector(),
        query.policy(),
        Receiver::listener(tx),
    ) {
        Ok(helper) => helper,
        Err(e) => {
            warn!(caller = %caller, error = %e, "Subscribe failed");
            metrics::record_error("subscribe");
            state.registry.unbind(&key, &link).await;
            reject(&mut sender, e.to_string()).await;
            return;
        }
    };
    metrics::record_subscription();
    debug!(caller = %caller, request = %helper.id(), "WebSocket subscriber connected");

    loop {
        tokio::select! {
            biased;

            event = link_events.recv() => {
                match event {
                    Some(LinkEvent::Connected(_)) => {}
                    Some(LinkEvent::Disconnected | LinkEvent::Failed(_)) | None => {
                        warn!(caller = %caller, "Location service link lost");
                        break;
                    }
                }
            }

            sample = samples.recv() => {
                let Some(sample) = sample else {
                    // The engine dropped the request.
                    break;
                };
                let body = match serde_json::to_string(&sample) {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "Failed to encode sample");
                        metrics::record_error("encode");
                        continue;
                    }
                };
                if sender.send(Message::Text(body)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(caller = %caller, "WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Subscribers only listen
                    }
                    Some(Err(e)) => {
                        warn!(caller = %caller, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                }
            }
        }
    }

    engine.unsubscribe(helper.id());
    state.registry.unbind(&key, &link).await;
    debug!(caller = %caller, request = %helper.id(), "WebSocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_query_defaults() {
        let query: SubscribeQuery = serde_json::from_str(r#"{"caller":"maps"}"#).unwrap();
        assert_eq!(query.selector(), ProviderSelector::Fused);
        assert_eq!(query.policy(), RequestPolicy::new());
    }

    #[test]
    fn test_subscribe_query_policy() {
        let query: SubscribeQuery = serde_json::from_str(
            r#"{
                "caller": "maps",
                "provider": "gps",
                "interval_ms": 1000,
                "fastest_interval_ms": 500,
                "smallest_displacement_m": 25.0,
                "max_updates": 3,
                "quality": "high_accuracy"
            }"#,
        )
        .unwrap();

        assert_eq!(query.selector(), ProviderSelector::named("gps"));
        let policy = query.policy();
        assert_eq!(policy.interval_ms, 1_000);
        assert_eq!(policy.fastest_interval_ms, 500);
        assert_eq!(policy.smallest_displacement_m, 25.0);
        assert_eq!(policy.max_update_count, Some(3));
        assert_eq!(policy.quality, Quality::HighAccuracy);
    }

    #[test]
    fn test_app_state_without_providers() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(state.engine.provider_names().is_empty());
    }

    #[tokio::test]
    async fn test_session_links_to_app_engine() {
        let state = AppState::new(Config::default()).unwrap();
        let key = ServiceKey::new(LOCATION_SERVICE);
        let (link, mut events) = SessionLink::new();
        let link: Arc<dyn Forwarder> = Arc::new(link);

        let engine = link_engine(&state.registry, &key, &link, &mut events)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&engine, &state.engine));
        assert_eq!(state.registry.stats().await.bound_count, 1);

        assert!(state.registry.unbind(&key, &link).await);
        assert_eq!(state.registry.stats().await.connection_count, 0);
    }

    #[tokio::test]
    async fn test_session_link_to_unknown_service_fails() {
        let state = AppState::new(Config::default()).unwrap();
        let key = ServiceKey::new("locus.unknown");
        let (link, mut events) = SessionLink::new();
        let link: Arc<dyn Forwarder> = Arc::new(link);

        let err = link_engine(&state.registry, &key, &link, &mut events)
            .await
            .unwrap_err();
        assert!(err.contains("locus.unknown"));
        assert!(state.registry.unbind(&key, &link).await);
    }

    #[test]
    fn test_app_state_missing_track() {
        let mut config = Config::default();
        config.providers.push(crate::config::ProviderConfig {
            name: "gps".into(),
            class: locus_core::AccuracyClass::Fine,
            track: "/nonexistent/track.ndjson".into(),
            min_period_ms: 1_000,
        });
        assert!(AppState::new(config).is_err());
    }
}
