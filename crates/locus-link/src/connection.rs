//! One shared physical connection.
//!
//! A [`SharedConnection`] is a pure state machine. The registry performs the
//! transport calls and feeds their outcome back in; the connection tracks
//! its forwarders and broadcasts every lifecycle change to them.
//!
//! ```text
//! Unbound ──bind──▶ Binding ──connected──▶ Bound ──lost──▶ Error
//!    ▲                 │                                 │  ▲
//!    │                 └────────failed───────────────────┼──┘
//!    └──────────── last forwarder leaves ◀───────────────┘
//! ```

use crate::traits::{same_forwarder, ConnectionError, Forwarder, ServiceHandle, ServiceKey};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unbound,
    Binding,
    Bound,
    Error,
}

/// A physical connection shared by its forwarders.
pub struct SharedConnection {
    key: ServiceKey,
    state: ConnectionState,
    forwarders: Vec<Arc<dyn Forwarder>>,
    handle: Option<ServiceHandle>,
    host: Option<String>,
    /// Generation of the current bind attempt, zero before the first.
    generation: u64,
    /// Whether the transport holds a bind for this key.
    bind_outstanding: bool,
    /// Set once the connection has been torn down and left the registry.
    evicted: bool,
    last_error: Option<ConnectionError>,
}

impl SharedConnection {
    #[must_use]
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            state: ConnectionState::Unbound,
            forwarders: Vec::new(),
            handle: None,
            host: None,
            generation: 0,
            bind_outstanding: false,
            evicted: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The bound service, present only while `Bound`.
    #[must_use]
    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    /// Host of the current or last bind attempt.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn bind_outstanding(&self) -> bool {
        self.bind_outstanding
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    #[must_use]
    pub fn forwarder_count(&self) -> usize {
        self.forwarders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }

    #[must_use]
    pub fn contains(&self, forwarder: &Arc<dyn Forwarder>) -> bool {
        self.forwarders.iter().any(|f| same_forwarder(f, forwarder))
    }

    /// Whether a new forwarder must trigger a fresh transport bind.
    #[must_use]
    pub fn needs_bind(&self) -> bool {
        match self.state {
            ConnectionState::Unbound => true,
            ConnectionState::Error => !self.bind_outstanding,
            ConnectionState::Binding | ConnectionState::Bound => false,
        }
    }

    /// Add a forwarder, replaying "connected" if already bound.
    ///
    /// Returns `false` if the forwarder was already registered.
    pub fn add_forwarder(&mut self, forwarder: Arc<dyn Forwarder>) -> bool {
        if self.contains(&forwarder) {
            return false;
        }
        if let (ConnectionState::Bound, Some(handle)) = (self.state, &self.handle) {
            forwarder.on_connected(&self.key, handle);
        }
        self.forwarders.push(forwarder);
        true
    }

    /// Remove a forwarder, telling it "disconnected" if currently bound.
    ///
    /// Returns `false` if the forwarder was not registered.
    pub fn remove_forwarder(&mut self, forwarder: &Arc<dyn Forwarder>) -> bool {
        let Some(index) = self.forwarders.iter().position(|f| same_forwarder(f, forwarder)) else {
            return false;
        };
        let removed = self.forwarders.swap_remove(index);
        if self.state == ConnectionState::Bound {
            removed.on_disconnected(&self.key);
        }
        true
    }

    /// Enter `Binding` for a new attempt identified by `generation`.
    pub fn begin_bind(&mut self, host: String, generation: u64) {
        debug!(key = %self.key, host = %host, generation, "Binding");
        self.state = ConnectionState::Binding;
        self.host = Some(host);
        self.generation = generation;
        self.bind_outstanding = true;
        self.handle = None;
        self.last_error = None;
    }

    /// The transport connected. Ignored for stale generations or when no
    /// bind is outstanding.
    pub fn on_connected(&mut self, generation: u64, handle: ServiceHandle) -> bool {
        if generation != self.generation || !self.bind_outstanding {
            debug!(key = %self.key, generation, current = self.generation, "Ignoring stale connect");
            return false;
        }
        debug!(key = %self.key, forwarders = self.forwarders.len(), "Connected");
        self.state = ConnectionState::Bound;
        for forwarder in &self.forwarders {
            forwarder.on_connected(&self.key, &handle);
        }
        self.handle = Some(handle);
        true
    }

    /// The transport lost a bound connection. The bind stays outstanding
    /// and the transport may connect again.
    pub fn on_disconnected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Bound {
            debug!(key = %self.key, generation, current = self.generation, "Ignoring stale disconnect");
            return false;
        }
        warn!(key = %self.key, forwarders = self.forwarders.len(), "Connection lost");
        self.state = ConnectionState::Error;
        self.handle = None;
        for forwarder in &self.forwarders {
            forwarder.on_disconnected(&self.key);
        }
        true
    }

    /// The transport gave up on the current attempt.
    pub fn on_failed(&mut self, generation: u64, error: ConnectionError) -> bool {
        if generation != self.generation || !self.bind_outstanding {
            debug!(key = %self.key, generation, current = self.generation, "Ignoring stale failure");
            return false;
        }
        self.fail(error);
        true
    }

    /// Enter `Error` with no bind outstanding and broadcast `error`.
    pub fn fail(&mut self, error: ConnectionError) {
        warn!(key = %self.key, error = %error, forwarders = self.forwarders.len(), "Connection failed");
        self.state = ConnectionState::Error;
        self.bind_outstanding = false;
        self.handle = None;
        for forwarder in &self.forwarders {
            forwarder.on_failed(&self.key, &error);
        }
        self.last_error = Some(error);
    }

    /// Tear the connection down after its last forwarder left.
    ///
    /// Returns `true` if the transport still holds a bind that must be
    /// released.
    pub fn teardown(&mut self) -> bool {
        debug_assert!(self.forwarders.is_empty(), "teardown with live forwarders");
        let release = self.bind_outstanding;
        self.state = ConnectionState::Unbound;
        self.bind_outstanding = false;
        self.handle = None;
        self.evicted = true;
        release
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("forwarders", &self.forwarders.len())
            .field("host", &self.host)
            .field("generation", &self.generation)
            .field("bind_outstanding", &self.bind_outstanding)
            .finish_non_exhaustive()
    }
}
