//! Request handles and pool leases
//!
//! A submitted request is tracked by a small shared slot holding its state.
//! Every move out of `Queued` is a compare-and-swap on that slot, so exactly
//! one of the dispatcher, the deadline sweep, a caller-side timeout or a
//! cancellation decides the outcome. Whoever holds the queue entry at that
//! point delivers the outcome to the caller.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::AdmissionError;
use crate::types::{Cost, LeaseId, RequestId, TenantId};

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestState {
    Arrived = 0,
    Admitted = 1,
    Queued = 2,
    Dispatched = 3,
    Rejected = 4,
    TimedOut = 5,
    Cancelled = 6,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestState::Arrived,
            1 => RequestState::Admitted,
            2 => RequestState::Queued,
            3 => RequestState::Dispatched,
            4 => RequestState::Rejected,
            5 => RequestState::TimedOut,
            _ => RequestState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Dispatched
                | RequestState::Rejected
                | RequestState::TimedOut
                | RequestState::Cancelled
        )
    }
}

#[derive(Debug)]
pub(crate) struct RequestSlot {
    state: AtomicU8,
}

impl RequestSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Arrived as u8),
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub(crate) type OutcomeSender = oneshot::Sender<Result<PoolLease, AdmissionError>>;
pub(crate) type OutcomeReceiver = oneshot::Receiver<Result<PoolLease, AdmissionError>>;

/// Controller side of a handle: queue withdrawal and lease recovery
pub(crate) trait QueueControl: Send + Sync {
    /// Remove a withdrawn request from the queue, if it is still there
    fn withdraw(&self, request_id: &RequestId);

    /// Release a lease that was delivered to a handle nobody read
    fn reclaim(self: Arc<Self>, lease: PoolLease);
}

/// Exclusive claim on one unit of pool capacity, held from dispatch until
/// it is handed back through `AdmissionController::complete`
#[derive(Debug)]
#[must_use = "a dispatched lease must be completed or pool capacity leaks"]
pub struct PoolLease {
    pub(crate) lease_id: LeaseId,
    pub(crate) request_id: RequestId,
    pub(crate) tenant_id: TenantId,
    pub(crate) cost: Cost,
    pub(crate) dispatched_at: Instant,
    pub(crate) queued_for: Duration,
}

impl PoolLease {
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    /// Time spent in the fair queue; zero for immediate dispatch
    pub fn queued_for(&self) -> Duration {
        self.queued_for
    }
}

/// Caller's view of a submitted request
#[derive(Debug)]
pub struct RequestHandle {
    request_id: RequestId,
    tenant_id: TenantId,
    deadline: Option<Instant>,
    slot: Arc<RequestSlot>,
    receiver: OutcomeReceiver,
    control: Option<Weak<dyn QueueControl>>,
}

impl RequestHandle {
    pub(crate) fn new(
        request_id: RequestId,
        tenant_id: TenantId,
        deadline: Option<Instant>,
        slot: Arc<RequestSlot>,
        receiver: OutcomeReceiver,
        control: Option<Weak<dyn QueueControl>>,
    ) -> Self {
        Self {
            request_id,
            tenant_id,
            deadline,
            slot,
            receiver,
            control,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> RequestState {
        self.slot.state()
    }

    /// Queue deadline, present only while the request waits in the queue
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the admission outcome.
    ///
    /// A queued request that is still waiting at its deadline resolves to
    /// `Timeout` and is never dispatched afterwards.
    pub async fn outcome(mut self) -> Result<PoolLease, AdmissionError> {
        let received = match self.deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, &mut self.receiver).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.withdraw(RequestState::TimedOut);
                        (&mut self.receiver).await
                    }
                }
            }
            None => (&mut self.receiver).await,
        };
        received.unwrap_or(Err(AdmissionError::ShuttingDown))
    }

    /// Non-blocking check for an outcome that has already been decided
    pub fn try_outcome(&mut self) -> Option<Result<PoolLease, AdmissionError>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(AdmissionError::ShuttingDown)),
        }
    }

    /// Cancel a still-queued request. Returns `false` if the request already
    /// left the queue; work that was dispatched is not stopped.
    pub fn cancel(&self) -> bool {
        self.withdraw(RequestState::Cancelled)
    }

    fn withdraw(&self, to: RequestState) -> bool {
        if !self.slot.transition(RequestState::Queued, to) {
            return false;
        }
        if let Some(control) = self.control.as_ref().and_then(Weak::upgrade) {
            control.withdraw(&self.request_id);
        }
        true
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        match self.slot.state() {
            // An abandoned queued request must not hold a place in the queue
            RequestState::Queued => {
                self.withdraw(RequestState::Cancelled);
            }
            RequestState::Dispatched => {
                if let Ok(Ok(lease)) = self.receiver.try_recv() {
                    if let Some(control) = self.control.as_ref().and_then(Weak::upgrade) {
                        control.reclaim(lease);
                    }
                }
            }
            _ => {}
        }
    }
}
