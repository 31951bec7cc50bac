//! Collaborator traits for shared connections.
//!
//! The registry never performs a physical bind itself. It drives a
//! [`Transport`] and fans the resulting lifecycle events out to every
//! [`Forwarder`] sharing the connection.

use crate::flags::BindFlags;
use crate::registry::TransportEvents;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of a remote service. One physical connection exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey(pub String);

impl ServiceKey {
    /// Create a new service key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServiceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServiceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque handle to a bound service, produced by the transport.
#[derive(Clone)]
pub struct ServiceHandle(Arc<dyn Any + Send + Sync>);

impl ServiceHandle {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Borrow the transport's handle as a concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Check whether two handles refer to the same bound service.
    #[must_use]
    pub fn ptr_eq(&self, other: &ServiceHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceHandle({:p})", Arc::as_ptr(&self.0))
    }
}

/// A host able to serve a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    /// Whether the host passed the transport's trust verification.
    pub trusted: bool,
}

impl HostInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, trusted: bool) -> Self {
        Self {
            name: name.into(),
            trusted,
        }
    }
}

/// One physical bind.
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub key: ServiceKey,
    pub host: String,
    pub flags: BindFlags,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport refused the bind.
    #[error("Bind rejected: {0}")]
    Rejected(String),

    /// The host is not reachable.
    #[error("Host unavailable: {0}")]
    Unavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Connection errors broadcast to forwarders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport refused or abandoned the bind.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// No acceptable host serves the key.
    #[error("No host available for {0}")]
    NoTarget(ServiceKey),
}

/// The collaborator performing physical binds.
///
/// `bind` returning `Ok` means the bind is outstanding; the outcome arrives
/// later through the [`TransportEvents`] handle. Events must be delivered
/// after `bind` returns, from the transport's own task, and may keep
/// arriving unprompted until `unbind`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hosts currently able to serve `key`.
    fn hosts(&self, key: &ServiceKey) -> Vec<HostInfo>;

    /// Start a physical bind.
    async fn bind(&self, request: BindRequest, events: TransportEvents) -> Result<(), TransportError>;

    /// Tear down the physical bind for `key`.
    async fn unbind(&self, key: &ServiceKey);

    /// Get the transport name.
    fn name(&self) -> &'static str;
}

/// A client sharing a connection.
///
/// Callbacks run while the connection is locked and must not block.
pub trait Forwarder: Send + Sync {
    fn on_connected(&self, key: &ServiceKey, handle: &ServiceHandle);

    fn on_disconnected(&self, key: &ServiceKey);

    fn on_failed(&self, key: &ServiceKey, error: &ConnectionError);
}

/// Check whether two forwarder handles are the same client.
pub(crate) fn same_forwarder(a: &Arc<dyn Forwarder>, b: &Arc<dyn Forwarder>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl Forwarder for Quiet {
        fn on_connected(&self, _key: &ServiceKey, _handle: &ServiceHandle) {}
        fn on_disconnected(&self, _key: &ServiceKey) {}
        fn on_failed(&self, _key: &ServiceKey, _error: &ConnectionError) {}
    }

    #[test]
    fn test_service_key_from_string() {
        let key: ServiceKey = "locus.location".into();
        assert_eq!(key.as_str(), "locus.location");
        assert_eq!(key.to_string(), "locus.location");
    }

    #[test]
    fn test_service_handle_downcast() {
        let handle = ServiceHandle::new(42u32);
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert!(handle.downcast_ref::<String>().is_none());
        assert!(handle.ptr_eq(&handle.clone()));
        assert!(!handle.ptr_eq(&ServiceHandle::new(42u32)));
    }

    #[test]
    fn test_same_forwarder() {
        let a: Arc<dyn Forwarder> = Arc::new(Quiet);
        let b: Arc<dyn Forwarder> = Arc::new(Quiet);
        assert!(same_forwarder(&a, &a.clone()));
        assert!(!same_forwarder(&a, &b));
    }
}
