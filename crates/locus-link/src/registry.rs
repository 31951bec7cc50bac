//! The connection registry.
//!
//! The registry maps each [`ServiceKey`] to one [`SharedConnection`]. Each
//! connection sits behind its own async mutex, so binds on different keys
//! never contend and every transition of one key is serialized.

use crate::connection::{ConnectionState, SharedConnection};
use crate::flags::BindFlags;
use crate::target::negotiate_host;
use crate::traits::{
    BindRequest, ConnectionError, Forwarder, ServiceHandle, ServiceKey, Transport, TransportError,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Entry = Arc<Mutex<SharedConnection>>;

/// Registry configuration.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Hosts to bind on, most preferred first. Empty uses the transport's order.
    pub host_preference: Vec<String>,
    /// Host accepted when no preferred host qualifies.
    pub fallback_host: Option<String>,
}

/// Options for the bind that creates a connection.
#[derive(Debug, Clone, Copy)]
pub struct BindOptions {
    pub flags: BindFlags,
    /// Only bind on hosts the transport reports as trusted.
    pub require_trusted: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            flags: BindFlags::standard(),
            require_trusted: false,
        }
    }
}

impl BindOptions {
    #[must_use]
    pub fn with_flags(mut self, flags: BindFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn require_trusted(mut self) -> Self {
        self.require_trusted = true;
        self
    }
}

/// Shares one physical connection per key among any number of forwarders.
pub struct ConnectionRegistry {
    me: Weak<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    config: RegistryConfig,
    connections: DashMap<ServiceKey, Entry>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_config(transport, RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(transport: Arc<dyn Transport>, config: RegistryConfig) -> Arc<Self> {
        info!(transport = transport.name(), "Creating connection registry with config: {:?}", config);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            config,
            connections: DashMap::new(),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Register `forwarder` on the connection for `key`.
    ///
    /// Returns whether a transport bind is outstanding or bound.
    pub async fn bind(&self, key: &ServiceKey, forwarder: Arc<dyn Forwarder>) -> bool {
        self.bind_with(key, forwarder, BindOptions::default()).await
    }

    /// Like [`bind`](Self::bind). `options` apply if this call starts a
    /// transport bind.
    pub async fn bind_with(
        &self,
        key: &ServiceKey,
        forwarder: Arc<dyn Forwarder>,
        options: BindOptions,
    ) -> bool {
        loop {
            let entry = self.entry_or_create(key);
            let mut conn = entry.lock().await;
            // Lost a race with the last unbind; the key has a fresh entry now.
            if conn.is_evicted() {
                continue;
            }

            if !conn.add_forwarder(Arc::clone(&forwarder)) {
                debug!(key = %key, "Forwarder already bound");
            }
            if !conn.needs_bind() {
                debug!(key = %key, state = ?conn.state(), forwarders = conn.forwarder_count(), "Joined connection");
                return true;
            }
            return self.start_bind(&mut conn, options).await;
        }
    }

    /// Remove `forwarder` from the connection for `key`. Releases the
    /// transport bind when the last forwarder leaves.
    ///
    /// Returns `false` if the forwarder was not bound to `key`.
    pub async fn unbind(&self, key: &ServiceKey, forwarder: &Arc<dyn Forwarder>) -> bool {
        let Some(entry) = self.entry(key) else {
            return false;
        };
        let mut conn = entry.lock().await;
        if conn.is_evicted() || !conn.remove_forwarder(forwarder) {
            return false;
        }

        if conn.is_empty() {
            if conn.teardown() {
                self.transport.unbind(key).await;
            }
            self.connections.remove_if(key, |_, v| Arc::ptr_eq(v, &entry));
            debug!(key = %key, "Connection released");
        } else {
            debug!(key = %key, forwarders = conn.forwarder_count(), "Forwarder left, connection kept");
        }
        true
    }

    /// State of the connection for `key`.
    pub async fn state(&self, key: &ServiceKey) -> Option<ConnectionState> {
        let entry = self.entry(key)?;
        let conn = entry.lock().await;
        Some(conn.state())
    }

    /// The bound service for `key`, if connected.
    pub async fn handle(&self, key: &ServiceKey) -> Option<ServiceHandle> {
        let entry = self.entry(key)?;
        let conn = entry.lock().await;
        conn.handle().cloned()
    }

    /// Number of forwarders sharing the connection for `key`.
    pub async fn forwarder_count(&self, key: &ServiceKey) -> usize {
        match self.entry(key) {
            Some(entry) => entry.lock().await.forwarder_count(),
            None => 0,
        }
    }

    /// Get registry statistics.
    pub async fn stats(&self) -> RegistryStats {
        let entries: Vec<Entry> = self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        let mut stats = RegistryStats {
            connection_count: entries.len(),
            ..RegistryStats::default()
        };
        for entry in entries {
            let conn = entry.lock().await;
            stats.forwarder_count += conn.forwarder_count();
            match conn.state() {
                ConnectionState::Bound => stats.bound_count += 1,
                ConnectionState::Error => stats.error_count += 1,
                ConnectionState::Binding | ConnectionState::Unbound => {}
            }
        }
        stats
    }

    fn entry(&self, key: &ServiceKey) -> Option<Entry> {
        self.connections.get(key).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_create(&self, key: &ServiceKey) -> Entry {
        let entry = self
            .connections
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SharedConnection::new(key.clone()))));
        Arc::clone(entry.value())
    }

    async fn start_bind(&self, conn: &mut SharedConnection, options: BindOptions) -> bool {
        let key = conn.key().clone();
        let hosts = self.transport.hosts(&key);
        let Some(host) = negotiate_host(
            &self.config.host_preference,
            &hosts,
            options.require_trusted,
            self.config.fallback_host.as_deref(),
        ) else {
            warn!(key = %key, available = hosts.len(), "No acceptable host");
            conn.fail(ConnectionError::NoTarget(key));
            return false;
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        conn.begin_bind(host.name.clone(), generation);

        let request = BindRequest {
            key: key.clone(),
            host: host.name.clone(),
            flags: options.flags,
        };
        let events = TransportEvents {
            registry: self.me.clone(),
            key: key.clone(),
            generation,
        };

        match self.transport.bind(request, events).await {
            Ok(()) => {
                debug!(key = %key, host = %host.name, flags = ?options.flags, "Transport bind outstanding");
                true
            }
            Err(e) => {
                conn.fail(ConnectionError::BindFailed(e.to_string()));
                false
            }
        }
    }
}

/// Handle a transport reports the outcome of one bind attempt through.
///
/// Events from an attempt that has since been superseded or released are
/// ignored.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    registry: Weak<ConnectionRegistry>,
    key: ServiceKey,
    generation: u64,
}

impl TransportEvents {
    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The service is connected. Returns `false` if the event was stale.
    pub async fn connected(&self, handle: ServiceHandle) -> bool {
        let Some(entry) = self.current() else {
            return false;
        };
        let mut conn = entry.lock().await;
        conn.on_connected(self.generation, handle)
    }

    /// A bound service was lost. Returns `false` if the event was stale.
    pub async fn disconnected(&self) -> bool {
        let Some(entry) = self.current() else {
            return false;
        };
        let mut conn = entry.lock().await;
        conn.on_disconnected(self.generation)
    }

    /// The transport gave up. Returns `false` if the event was stale.
    pub async fn failed(&self, error: TransportError) -> bool {
        let Some(entry) = self.current() else {
            return false;
        };
        let mut conn = entry.lock().await;
        conn.on_failed(self.generation, ConnectionError::BindFailed(error.to_string()))
    }

    fn current(&self) -> Option<Entry> {
        self.registry.upgrade()?.entry(&self.key)
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Total forwarders across connections.
    pub forwarder_count: usize,
    /// Connections currently bound.
    pub bound_count: usize,
    /// Connections in the error state.
    pub error_count: usize,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
