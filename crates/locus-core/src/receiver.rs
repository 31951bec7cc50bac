//! Delivery endpoints for location subscribers.
//!
//! A subscriber names exactly one endpoint when it subscribes. Each endpoint
//! kind has its own callback shape, but the engine only ever calls
//! [`Receiver::deliver`] and [`Receiver::is_alive`].
//!
//! Delivery runs on the sample dispatch path. Implementations may call back
//! into the engine to unsubscribe, but must not inject samples from inside a
//! delivery.

use crate::request::RequestId;
use crate::sample::LocationSample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The remote endpoint has terminated.
    #[error("Receiver is gone")]
    ReceiverGone,

    /// The endpoint refused the delivery.
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// A batch of samples handed to a [`LocationCallback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub samples: Vec<LocationSample>,
}

impl LocationResult {
    /// The most recent sample in the batch.
    #[must_use]
    pub fn last(&self) -> Option<&LocationSample> {
        self.samples.last()
    }
}

/// Payload fired through a [`PendingAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationIntent {
    pub request: RequestId,
    pub sample: LocationSample,
}

/// Payload handed to a [`StatusCallback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub request: RequestId,
    pub sample: LocationSample,
    /// Number of samples delivered including this one.
    pub delivered: u32,
    /// Updates still owed, `None` if unbounded.
    pub remaining: Option<u32>,
}

/// Receives one sample per update.
pub trait LocationListener: Send + Sync {
    fn on_location_changed(&self, sample: &LocationSample) -> Result<(), DeliveryError>;

    /// Whether the remote end is still reachable.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Receives samples wrapped in a [`LocationResult`].
pub trait LocationCallback: Send + Sync {
    fn on_location_result(&self, result: LocationResult) -> Result<(), DeliveryError>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// A fire-and-forget action; liveness is only known when sending fails.
pub trait PendingAction: Send + Sync {
    fn send(&self, intent: LocationIntent) -> Result<(), DeliveryError>;
}

/// Receives samples together with the request's delivery bookkeeping.
pub trait StatusCallback: Send + Sync {
    fn on_status(&self, update: StatusUpdate) -> Result<(), DeliveryError>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// One dispatch to a receiver.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub request: RequestId,
    pub sample: &'a LocationSample,
    /// 1-based sequence number of this delivery.
    pub sequence: u32,
    pub remaining: Option<u32>,
}

/// The endpoint of a location subscription.
#[derive(Clone)]
pub enum Receiver {
    Listener(Arc<dyn LocationListener>),
    Callback(Arc<dyn LocationCallback>),
    PendingAction(Arc<dyn PendingAction>),
    StatusCallback(Arc<dyn StatusCallback>),
}

impl Receiver {
    #[must_use]
    pub fn listener(listener: impl LocationListener + 'static) -> Self {
        Receiver::Listener(Arc::new(listener))
    }

    #[must_use]
    pub fn callback(callback: impl LocationCallback + 'static) -> Self {
        Receiver::Callback(Arc::new(callback))
    }

    #[must_use]
    pub fn pending_action(action: impl PendingAction + 'static) -> Self {
        Receiver::PendingAction(Arc::new(action))
    }

    #[must_use]
    pub fn status_callback(callback: impl StatusCallback + 'static) -> Self {
        Receiver::StatusCallback(Arc::new(callback))
    }

    /// Short name of the endpoint kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Receiver::Listener(_) => "listener",
            Receiver::Callback(_) => "callback",
            Receiver::PendingAction(_) => "pending_action",
            Receiver::StatusCallback(_) => "status_callback",
        }
    }

    /// Deliver a sample to the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable or refused the sample.
    pub fn deliver(&self, delivery: Delivery<'_>) -> Result<(), DeliveryError> {
        match self {
            Receiver::Listener(listener) => listener.on_location_changed(delivery.sample),
            Receiver::Callback(callback) => callback.on_location_result(LocationResult {
                samples: vec![*delivery.sample],
            }),
            Receiver::PendingAction(action) => action.send(LocationIntent {
                request: delivery.request,
                sample: *delivery.sample,
            }),
            Receiver::StatusCallback(callback) => callback.on_status(StatusUpdate {
                request: delivery.request,
                sample: *delivery.sample,
                delivered: delivery.sequence,
                remaining: delivery.remaining,
            }),
        }
    }

    /// Whether the endpoint is still reachable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Receiver::Listener(listener) => listener.is_alive(),
            Receiver::Callback(callback) => callback.is_alive(),
            Receiver::PendingAction(_) => true,
            Receiver::StatusCallback(callback) => callback.is_alive(),
        }
    }

    /// Check whether two receivers point at the same endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &Receiver) -> bool {
        self.endpoint() == other.endpoint()
    }

    fn endpoint(&self) -> *const () {
        match self {
            Receiver::Listener(inner) => Arc::as_ptr(inner) as *const (),
            Receiver::Callback(inner) => Arc::as_ptr(inner) as *const (),
            Receiver::PendingAction(inner) => Arc::as_ptr(inner) as *const (),
            Receiver::StatusCallback(inner) => Arc::as_ptr(inner) as *const (),
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Receiver::{}({:p})", self.kind(), self.endpoint())
    }
}

impl LocationListener for mpsc::UnboundedSender<LocationSample> {
    fn on_location_changed(&self, sample: &LocationSample) -> Result<(), DeliveryError> {
        self.send(*sample).map_err(|_| DeliveryError::ReceiverGone)
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }
}

impl StatusCallback for mpsc::UnboundedSender<StatusUpdate> {
    fn on_status(&self, update: StatusUpdate) -> Result<(), DeliveryError> {
        self.send(update).map_err(|_| DeliveryError::ReceiverGone)
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }
}
