//! In-process transport for the daemon's services.
//!
//! WebSocket sessions reach the fusion engine through the connection
//! registry, so every session shares one bind to the location service.

use async_trait::async_trait;
use locus_link::{
    BindRequest, ConnectionError, Forwarder, HostInfo, ServiceHandle, ServiceKey, Transport,
    TransportError, TransportEvents,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Key of the fusion engine service.
pub const LOCATION_SERVICE: &str = "locus.location";

/// Host name of the in-process transport.
const LOCAL_HOST: &str = "local";

/// Transport serving handles registered in this process.
#[derive(Debug, Default)]
pub struct LocalTransport {
    services: RwLock<HashMap<ServiceKey, ServiceHandle>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `handle` under `key`, replacing any previous handle.
    pub fn register(&self, key: ServiceKey, handle: ServiceHandle) {
        debug!(key = %key, "Local service registered");
        self.services.write().insert(key, handle);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn hosts(&self, key: &ServiceKey) -> Vec<HostInfo> {
        if self.services.read().contains_key(key) {
            vec![HostInfo::new(LOCAL_HOST, true)]
        } else {
            Vec::new()
        }
    }

    async fn bind(&self, request: BindRequest, events: TransportEvents) -> Result<(), TransportError> {
        let handle = self
            .services
            .read()
            .get(&request.key)
            .cloned()
            .ok_or_else(|| TransportError::Unavailable(request.key.to_string()))?;

        // Events must not arrive before bind returns.
        tokio::spawn(async move {
            events.connected(handle).await;
        });
        Ok(())
    }

    async fn unbind(&self, key: &ServiceKey) {
        debug!(key = %key, "Local bind released");
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Connection lifecycle as seen by one session.
#[derive(Debug)]
pub enum LinkEvent {
    Connected(ServiceHandle),
    Disconnected,
    Failed(ConnectionError),
}

/// Forwarder relaying lifecycle events into a session's channel.
#[derive(Debug)]
pub struct SessionLink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl SessionLink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Forwarder for SessionLink {
    fn on_connected(&self, _key: &ServiceKey, handle: &ServiceHandle) {
        let _ = self.tx.send(LinkEvent::Connected(handle.clone()));
    }

    fn on_disconnected(&self, _key: &ServiceKey) {
        let _ = self.tx.send(LinkEvent::Disconnected);
    }

    fn on_failed(&self, _key: &ServiceKey, error: &ConnectionError) {
        let _ = self.tx.send(LinkEvent::Failed(error.clone()));
    }
}
