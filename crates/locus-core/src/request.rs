//! Per-subscriber request bookkeeping.
//!
//! A [`RequestHelper`] pairs a policy with a receiver and remembers what it
//! last delivered. Throttling always compares against the last *dispatched*
//! sample, so a subscriber's cadence does not drift with provider jitter.

use crate::auth::CallerId;
use crate::policy::RequestPolicy;
use crate::receiver::{Delivery, DeliveryError, Receiver};
use crate::sample::LocationSample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate the next request ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw ID.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw ID.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Why a sample was not dispatched to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Identical to the last dispatched sample.
    Duplicate,
    /// Older than the last dispatched sample.
    Stale,
    /// Too soon after the last dispatched sample.
    Interval,
    /// Too close to the last dispatched sample.
    Displacement,
}

/// Result of offering a sample to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The sample was delivered. `completed` is set when this delivery
    /// exhausted the policy's update count.
    Delivered { completed: bool },
    /// The policy suppressed the sample; bookkeeping is unchanged.
    Throttled(ThrottleReason),
    /// The receiver could not be reached.
    Failed(DeliveryError),
    /// The policy expired before this sample.
    Expired,
    /// The request was already retired.
    Inactive,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    last_dispatched: Option<LocationSample>,
    dispatched_count: u32,
}

/// Delivery state for one subscriber.
pub struct RequestHelper {
    id: RequestId,
    caller: CallerId,
    policy: RequestPolicy,
    receiver: Receiver,
    providers: Vec<String>,
    active: AtomicBool,
    /// Serializes evaluate-and-deliver so dispatches never reorder.
    gate: Mutex<()>,
    book: Mutex<Bookkeeping>,
}

impl RequestHelper {
    pub(crate) fn new(
        caller: CallerId,
        policy: RequestPolicy,
        receiver: Receiver,
        providers: Vec<String>,
    ) -> Self {
        Self {
            id: RequestId::next(),
            caller,
            policy,
            receiver,
            providers,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            book: Mutex::new(Bookkeeping::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    #[must_use]
    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    #[must_use]
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Names of the providers this request is attached to.
    #[must_use]
    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    /// Whether the request can still receive samples.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dispatched_count(&self) -> u32 {
        self.book.lock().dispatched_count
    }

    #[must_use]
    pub fn last_dispatched(&self) -> Option<LocationSample> {
        self.book.lock().last_dispatched
    }

    /// Mark the request retired. Returns `true` if it was active.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Evaluate `sample` against the policy and deliver it if it passes.
    pub fn offer(&self, sample: &LocationSample, now_ms: u64) -> DispatchOutcome {
        let _gate = self.gate.lock();
        if !self.is_active() {
            return DispatchOutcome::Inactive;
        }
        if self.policy.is_expired(now_ms) {
            return DispatchOutcome::Expired;
        }

        let (last, count) = {
            let book = self.book.lock();
            (book.last_dispatched, book.dispatched_count)
        };

        if let Some(last) = last {
            if let Some(reason) = self.throttle(&last, sample) {
                trace!(request = %self.id, ?reason, "Sample throttled");
                return DispatchOutcome::Throttled(reason);
            }
        }

        let sequence = count + 1;
        let delivery = Delivery {
            request: self.id,
            sample,
            sequence,
            remaining: self.policy.remaining(sequence),
        };
        if let Err(e) = self.receiver.deliver(delivery) {
            return DispatchOutcome::Failed(e);
        }

        {
            let mut book = self.book.lock();
            book.last_dispatched = Some(*sample);
            book.dispatched_count = sequence;
        }

        let completed = self.policy.is_complete(sequence);
        if completed {
            self.active.store(false, Ordering::Release);
        }
        DispatchOutcome::Delivered { completed }
    }

    fn throttle(&self, last: &LocationSample, sample: &LocationSample) -> Option<ThrottleReason> {
        if sample == last {
            return Some(ThrottleReason::Duplicate);
        }
        if sample.timestamp_ms < last.timestamp_ms {
            return Some(ThrottleReason::Stale);
        }
        let elapsed = sample.timestamp_ms - last.timestamp_ms;
        if elapsed < self.policy.effective_fastest_interval_ms() {
            return Some(ThrottleReason::Interval);
        }
        if last.distance_to(sample) < self.policy.smallest_displacement_m {
            return Some(ThrottleReason::Displacement);
        }
        None
    }
}

impl fmt::Debug for RequestHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHelper")
            .field("id", &self.id)
            .field("caller", &self.caller)
            .field("policy", &self.policy)
            .field("receiver", &self.receiver)
            .field("providers", &self.providers)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
