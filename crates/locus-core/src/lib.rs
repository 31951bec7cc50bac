//! # locus-core
//!
//! Location fusion and request dispatch for the Locus location service.
//!
//! This crate provides the building blocks of the fused location engine:
//!
//! - **LocationSample** - A timestamped position fix and great-circle geodesy
//! - **RequestPolicy** - Per-subscriber rate, distance, count and lifetime limits
//! - **Receiver** - Where a subscriber wants its samples delivered
//! - **RequestHelper** - Per-subscriber delivery bookkeeping and throttling
//! - **ProviderState** - A physical location source and its attached requests
//! - **MockOverride** - Synthetic location that preempts every real provider
//! - **FusionEngine** - The coordinator tying all of the above together
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ samples ┌──────────────┐ snapshot ┌───────────────┐
//! │LocationSource│────────▶│ProviderState │─────────▶│ RequestHelper │──▶ Receiver
//! └──────────────┘         └──────────────┘          └───────────────┘
//!        ▲                        ▲                          ▲
//!        │ start/stop             │ attach/detach            │ offer
//!        └────────────────┬───────┴──────────────────────────┘
//!                  ┌──────────────┐      ┌──────────────┐
//!                  │ FusionEngine │◀────▶│ MockOverride │
//!                  └──────────────┘      └──────────────┘
//! ```

pub mod auth;
pub mod clock;
pub mod engine;
pub mod mock;
pub mod policy;
pub mod provider;
pub mod receiver;
pub mod request;
pub mod sample;

pub use auth::{AccessTier, AllowAll, Authorization, CallerId, StaticAuthorization, Tier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    DispatchReport, EngineConfig, EngineError, EngineSnapshot, EngineStats, FusionEngine,
    ProviderSelector, ProviderSnapshot, RequestSnapshot,
};
pub use mock::MockOverride;
pub use policy::{Quality, RequestPolicy};
pub use provider::{AccuracyClass, LocationSource, ProviderState, SampleSink, SourceError, StreamParams};
pub use receiver::{
    Delivery, DeliveryError, LocationCallback, LocationIntent, LocationListener, LocationResult,
    PendingAction, Receiver, StatusCallback, StatusUpdate,
};
pub use request::{DispatchOutcome, RequestHelper, RequestId, ThrottleReason};
pub use sample::{great_circle_distance, LocationSample, EARTH_RADIUS_M};
