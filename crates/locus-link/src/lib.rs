//! # locus-link
//!
//! Shared service connections for Locus.
//!
//! Many independent clients often need the same remote service. This crate
//! lets them share exactly one physical connection per service identity:
//!
//! - **ConnectionRegistry** - Key to connection table, the bind/unbind entry point
//! - **SharedConnection** - One connection's state machine and its forwarders
//! - **Transport** - The collaborator that performs the physical bind
//! - **Forwarder** - A client receiving connection lifecycle events
//!
//! ```rust,ignore
//! use locus_link::{ConnectionRegistry, ServiceKey};
//!
//! let registry = ConnectionRegistry::new(transport);
//! let key = ServiceKey::new("locus.location");
//! registry.bind(&key, forwarder.clone()).await;
//! // ...
//! registry.unbind(&key, &forwarder).await;
//! ```

pub mod connection;
pub mod flags;
pub mod registry;
pub mod target;
pub mod traits;

pub use connection::{ConnectionState, SharedConnection};
pub use flags::BindFlags;
pub use registry::{BindOptions, ConnectionRegistry, RegistryConfig, RegistryStats, TransportEvents};
pub use target::negotiate_host;
pub use traits::{
    BindRequest, ConnectionError, Forwarder, HostInfo, ServiceHandle, ServiceKey, Transport,
    TransportError,
};
