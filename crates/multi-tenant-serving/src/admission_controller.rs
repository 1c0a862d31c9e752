//! Admission Controller Module
//!
//! Decides, for every request, whether it is dispatched onto the shared
//! resource pool right away, waits in the weighted fair queue, or is
//! rejected. Per request:
//!
//! ```text
//! Arrived -> {Admitted, Queued} -> {Dispatched, Rejected, TimedOut, Cancelled}
//! ```
//!
//! Arrival checks run in a fixed order: tenant quota, token bucket, pool
//! capacity. A dispatch pass runs after every lease release, after every
//! enqueue and on the background loop's tick; it re-checks quota and rate for
//! each dequeued entry because both may have changed while it waited.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AdmissionConfig, ConfigError};
use crate::error::{AdmissionError, PoolError, RejectKind};
use crate::request::{
    OutcomeSender, PoolLease, QueueControl, RequestHandle, RequestSlot, RequestState,
};
use crate::resource_pool::{PoolCapacity, ResourcePool};
use crate::stats::{AdmissionCounters, AdmissionStats, TenantUsage, fairness_index};
use crate::tenant_registry::{RegistryError, TenantRegistry};
use crate::token_bucket::RateLimiter;
use crate::types::{Cost, LeaseId, RateLimit, RequestId, TenantId, TenantPolicy};
use crate::weighted_fair_queuing::{FairQueueEntry, WeightedFairQueue};

/// Mutable per-tenant admission state, lockable independently of other tenants
#[derive(Debug, Default)]
struct TenantState {
    in_flight: AtomicU32,
    dispatched: AtomicU64,
}

impl TenantState {
    fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take one in-flight slot if the tenant is below `quota`
    fn try_reserve(&self, quota: u32) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < quota).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give back one in-flight slot; `false` on underflow
    fn release(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }
}

#[derive(Debug)]
struct QueuedRequest {
    slot: Arc<RequestSlot>,
    sender: OutcomeSender,
    deadline: Instant,
    /// Queued on rate limit: tokens are taken at dispatch instead of arrival
    needs_tokens: bool,
    rate: RateLimit,
}

type QueueEntry = FairQueueEntry<QueuedRequest>;

#[derive(Debug)]
struct Shared {
    config: AdmissionConfig,
    registry: TenantRegistry,
    limiter: RateLimiter,
    tenants: DashMap<TenantId, Arc<TenantState>>,
    queue: Mutex<WeightedFairQueue<QueuedRequest>>,
    pool: Arc<dyn ResourcePool>,
    counters: AdmissionCounters,
    wake: Arc<Notify>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-tenant admission controller
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Create a controller in front of `pool`. The background dispatch loop is
    /// not running until [`start`](Self::start) is called.
    pub fn new(config: AdmissionConfig, pool: Arc<dyn ResourcePool>) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = if config.strict_registration {
            TenantRegistry::strict(config.default_policy.clone())
        } else {
            TenantRegistry::new(config.default_policy.clone())
        };
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                limiter: RateLimiter::new(),
                tenants: DashMap::new(),
                queue: Mutex::new(WeightedFairQueue::new()),
                pool,
                counters: AdmissionCounters::default(),
                wake: Arc::new(Notify::new()),
                closed: AtomicBool::new(false),
                shutdown,
                dispatch_loop: Mutex::new(None),
            }),
        })
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.shared.registry
    }

    pub fn register_tenant(&self, tenant_id: &str, policy: TenantPolicy) -> Result<(), RegistryError> {
        self.shared.registry.register(tenant_id, policy)
    }

    /// Set a tenant's policy, registering it if needed. Applies to admission
    /// decisions made from now on; queued requests keep the weight and
    /// deadline they were enqueued with.
    pub fn set_policy(&self, tenant_id: &str, policy: TenantPolicy) -> Result<(), RegistryError> {
        self.shared.registry.upsert(tenant_id, policy)
    }

    /// Submit a request for `tenant_id`.
    ///
    /// Immediate outcomes (dispatch or rejection) are already decided when
    /// this returns; a queued request resolves through the handle no later
    /// than the earlier of `deadline` and the tenant's `max_wait`.
    pub async fn submit(
        &self,
        tenant_id: &str,
        cost: Cost,
        deadline: Option<Instant>,
    ) -> RequestHandle {
        let request_id = RequestId::new();
        let slot = Arc::new(RequestSlot::new());
        let (sender, receiver) = oneshot::channel();
        self.shared.counters.submitted();

        let queue_deadline = self
            .shared
            .admit(request_id, tenant_id, cost, deadline, &slot, sender)
            .await;

        let control: Weak<dyn QueueControl> = Arc::downgrade(&self.shared) as Weak<dyn QueueControl>;
        RequestHandle::new(
            request_id,
            tenant_id.to_string(),
            queue_deadline,
            slot,
            receiver,
            Some(control),
        )
    }

    /// Release a dispatched lease back to the pool and hand the freed
    /// capacity to the next queued request.
    ///
    /// A `PoolError` here means lease accounting was violated by the pool
    /// adapter; it is counted and logged, and the tenant's in-flight slot is
    /// released regardless.
    pub async fn complete(&self, lease: PoolLease) -> Result<(), PoolError> {
        let result = self.shared.release_lease(lease).await;
        if result.is_ok() {
            self.shared.counters.completed();
        }
        self.shared.drain(None).await;
        result
    }

    /// Submit, wait for admission, run `work`, then complete the lease.
    ///
    /// The lease is returned to the pool even if this future is dropped while
    /// `work` runs or `work` panics.
    pub async fn serve<F, Fut, T>(
        &self,
        tenant_id: &str,
        cost: Cost,
        deadline: Option<Instant>,
        work: F,
    ) -> Result<T, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.submit(tenant_id, cost, deadline).await.outcome().await?;
        let guard = LeaseGuard {
            controller: self.clone(),
            lease: Some(lease),
        };
        let output = work().await;
        if let Err(e) = guard.complete().await {
            warn!(tenant_id = %tenant_id, "Lease release reported an accounting error: {}", e);
        }
        Ok(output)
    }

    /// Complete a lease from a context that cannot await, such as `Drop`
    fn release_detached(&self, lease: PoolLease) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let controller = self.clone();
                runtime.spawn(async move {
                    if let Err(e) = controller.complete(lease).await {
                        warn!("Detached lease release reported an accounting error: {}", e);
                    }
                });
            }
            Err(_) => {
                self.shared.counters.invariant_violation();
                error!(
                    tenant_id = %lease.tenant_id,
                    lease = %lease.lease_id,
                    "No runtime available to release an abandoned lease"
                );
            }
        }
    }

    /// Start the background dispatch loop; a no-op if it is already running
    pub fn start(&self) {
        let mut dispatch_loop = self.shared.dispatch_loop.lock();
        if dispatch_loop.is_some() || self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        // The loop only borrows the controller per pass; once every clone is
        // dropped the shutdown sender goes with it and the loop exits
        let shared = Arc::downgrade(&self.shared);
        let wake = self.shared.wake.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        let interval = self.shared.config.sweep_interval();

        *dispatch_loop = Some(tokio::spawn(async move {
            info!("Dispatch loop started with interval {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let sweep = tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = wake.notified() => false,
                    _ = ticker.tick() => true,
                };
                let Some(shared) = shared.upgrade() else { break };
                if sweep {
                    shared.sweep_expired();
                }
                shared.drain(None).await;
            }

            info!("Dispatch loop stopped");
        }));
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .dispatch_loop
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the dispatch loop and reject everything still queued with
    /// `ShuttingDown`. Outstanding leases stay valid and can be completed.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown.send(true);

        let handle = self.shared.dispatch_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatch loop terminated abnormally: {}", e);
            }
        }

        self.shared.fail_queued(AdmissionError::ShuttingDown);
        info!("Admission controller shut down");
    }

    /// Remove expired queued requests now instead of waiting for the loop
    pub fn sweep_expired(&self) {
        self.shared.sweep_expired();
    }

    /// Run a dispatch pass now, e.g. after the pool grew
    pub async fn dispatch_pending(&self) {
        self.shared.drain(None).await;
    }

    pub fn stats(&self) -> AdmissionStats {
        let (depth, virtual_time) = {
            let queue = self.shared.queue.lock();
            (queue.len(), queue.virtual_time())
        };
        self.shared
            .counters
            .snapshot(depth, virtual_time, self.shared.pool.capacity())
    }

    pub fn tenant_usage(&self, tenant_id: &str) -> TenantUsage {
        let policy = self.shared.registry.lookup(tenant_id);
        let (in_flight, dispatched_total) = match self.shared.tenants.get(tenant_id) {
            Some(state) => (state.in_flight(), state.dispatched.load(Ordering::Relaxed)),
            None => (0, 0),
        };

        TenantUsage {
            tenant_id: tenant_id.to_string(),
            in_flight,
            dispatched_total,
            queued: self.shared.queue.lock().tenant_depth(tenant_id),
            tokens_available: self.shared.limiter.available(tenant_id, &policy.rate),
        }
    }

    /// Jain's index over weight-normalised dispatch counts of every tenant
    /// that has dispatched at least once
    pub fn fairness_index(&self) -> f64 {
        let samples: Vec<(u32, u64)> = self
            .shared
            .tenants
            .iter()
            .map(|entry| {
                (
                    self.shared.registry.lookup(entry.key()).weight,
                    entry.value().dispatched.load(Ordering::Relaxed),
                )
            })
            .filter(|(_, dispatched)| *dispatched > 0)
            .collect();
        fairness_index(&samples)
    }

    pub fn capacity(&self) -> PoolCapacity {
        self.shared.pool.capacity()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Shared {
    fn tenant_state(&self, tenant_id: &str) -> Arc<TenantState> {
        if let Some(state) = self.tenants.get(tenant_id) {
            return state.value().clone();
        }
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Run the arrival checks. Immediate outcomes are sent on `sender`;
    /// returns the queue deadline when the request was queued.
    async fn admit(
        &self,
        request_id: RequestId,
        tenant_id: &str,
        cost: Cost,
        deadline: Option<Instant>,
        slot: &Arc<RequestSlot>,
        sender: OutcomeSender,
    ) -> Option<Instant> {
        let arrived_at = Instant::now();

        if self.closed.load(Ordering::Acquire) {
            self.reject(tenant_id, slot, sender, AdmissionError::ShuttingDown);
            return None;
        }
        if !cost.is_finite() || cost <= 0.0 {
            self.reject(tenant_id, slot, sender, AdmissionError::InvalidCost(cost));
            return None;
        }
        if self.registry.is_strict() && !self.registry.contains(tenant_id) {
            self.reject(
                tenant_id,
                slot,
                sender,
                AdmissionError::UnknownTenant(tenant_id.to_string()),
            );
            return None;
        }

        let policy = self.registry.lookup(tenant_id);
        let tenant = self.tenant_state(tenant_id);

        // Quota first: a tenant at quota never touches its bucket or the queue
        if tenant.in_flight() >= policy.max_in_flight {
            self.reject(tenant_id, slot, sender, quota_exceeded(tenant_id));
            return None;
        }

        let needs_tokens = !self.limiter.try_consume(tenant_id, &policy.rate, cost);
        if needs_tokens && !policy.queue_on_rate_limit {
            self.reject(
                tenant_id,
                slot,
                sender,
                AdmissionError::RateLimited {
                    tenant_id: tenant_id.to_string(),
                },
            );
            return None;
        }
        let refund = |shared: &Self| {
            if !needs_tokens {
                shared.limiter.refund(tenant_id, &policy.rate, cost);
            }
        };

        let mut spare_lease = None;
        if !needs_tokens {
            match self.pool.try_acquire().await {
                Ok(Some(lease_id)) if self.queue.lock().is_empty() => {
                    if tenant.try_reserve(policy.max_in_flight) {
                        slot.transition(RequestState::Arrived, RequestState::Admitted);
                        slot.transition(RequestState::Admitted, RequestState::Dispatched);
                        let lease = PoolLease {
                            lease_id,
                            request_id,
                            tenant_id: tenant_id.to_string(),
                            cost,
                            dispatched_at: Instant::now(),
                            queued_for: Duration::ZERO,
                        };
                        tenant.dispatched.fetch_add(1, Ordering::Relaxed);
                        self.counters.dispatched(false);
                        debug!(
                            tenant_id = %tenant_id,
                            request_id = %request_id,
                            lease = %lease_id,
                            "Dispatched immediately"
                        );
                        if let Err(Ok(lease)) = sender.send(Ok(lease)) {
                            let _ = self.release_lease(lease).await;
                        }
                        return None;
                    }

                    // Lost a race with a concurrent request of the same tenant
                    self.release_pool_lease(lease_id).await;
                    refund(self);
                    self.reject(tenant_id, slot, sender, quota_exceeded(tenant_id));
                    return None;
                }
                // Others are already waiting; this lease goes to the head of the queue
                Ok(Some(lease_id)) => spare_lease = Some(lease_id),
                Ok(None) => {}
                Err(e) => {
                    if e != PoolError::Closed {
                        self.invariant_violation(&e);
                    }
                    refund(self);
                    self.reject(tenant_id, slot, sender, AdmissionError::PoolUnavailable);
                    return None;
                }
            }
        }

        let max_wait_deadline = arrived_at + policy.max_wait();
        let queue_deadline = deadline.map_or(max_wait_deadline, |d| d.min(max_wait_deadline));
        if queue_deadline <= arrived_at {
            if let Some(lease_id) = spare_lease {
                self.release_pool_lease(lease_id).await;
            }
            refund(self);
            self.reject(
                tenant_id,
                slot,
                sender,
                AdmissionError::Timeout {
                    tenant_id: tenant_id.to_string(),
                    waited: Duration::ZERO,
                },
            );
            return None;
        }

        let request = QueuedRequest {
            slot: slot.clone(),
            sender,
            deadline: queue_deadline,
            needs_tokens,
            rate: policy.rate,
        };
        let overflow = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_depth {
                Some((request, queue.len()))
            } else {
                slot.transition(RequestState::Arrived, RequestState::Queued);
                let finish =
                    queue.enqueue(request_id, tenant_id, cost, policy.weight, arrived_at, request);
                debug!(
                    tenant_id = %tenant_id,
                    request_id = %request_id,
                    virtual_finish = finish,
                    rate_limited = needs_tokens,
                    "Queued request"
                );
                None
            }
        };

        if let Some((request, depth)) = overflow {
            if let Some(lease_id) = spare_lease {
                self.release_pool_lease(lease_id).await;
            }
            refund(self);
            self.reject(
                tenant_id,
                slot,
                request.sender,
                AdmissionError::QueueFull { depth },
            );
            return None;
        }

        self.counters.queued();
        self.wake.notify_one();
        self.drain(spare_lease).await;
        Some(queue_deadline)
    }

    /// Hand free pool capacity to queued requests in fair-queue order
    async fn drain(&self, mut spare: Option<LeaseId>) {
        loop {
            let lease_id = match spare.take() {
                Some(lease_id) => lease_id,
                None => {
                    if self.queue.lock().is_empty() {
                        return;
                    }
                    match self.pool.try_acquire().await {
                        Ok(Some(lease_id)) => lease_id,
                        Ok(None) => return,
                        Err(PoolError::Closed) => {
                            warn!("Resource pool closed, failing queued requests");
                            self.fail_queued(AdmissionError::PoolUnavailable);
                            return;
                        }
                        Err(e) => {
                            self.invariant_violation(&e);
                            return;
                        }
                    }
                }
            };

            match self.next_dispatchable() {
                Some((entry, tenant)) => self.dispatch(entry, tenant, lease_id).await,
                None => {
                    self.release_pool_lease(lease_id).await;
                    return;
                }
            }
        }
    }

    /// Take entries in fair-queue order until one passes its dispatch-time
    /// checks. A tenant blocked by quota or rate is skipped for the rest of
    /// the pass; its entry goes back with its original virtual finish time and
    /// global virtual time only advances for the entry that is dispatched.
    fn next_dispatchable(&self) -> Option<(QueueEntry, Arc<TenantState>)> {
        let mut blocked: HashSet<TenantId> = HashSet::new();

        loop {
            let next = self
                .queue
                .lock()
                .take_where(|entry| !blocked.contains(&entry.tenant_id));
            let mut entry = next?;
            let now = Instant::now();

            if entry.payload.slot.state() != RequestState::Queued || entry.payload.deadline <= now {
                self.settle_withdrawn(entry, now);
                continue;
            }

            let tenant = self.tenant_state(&entry.tenant_id);
            let quota = self.registry.lookup(&entry.tenant_id).max_in_flight;
            if !tenant.try_reserve(quota) {
                blocked.insert(entry.tenant_id.clone());
                self.defer(entry);
                continue;
            }
            if entry.payload.needs_tokens {
                // Charged against the bucket as it is configured now
                if !self
                    .limiter
                    .charge(&entry.tenant_id, &entry.payload.rate, entry.cost)
                {
                    tenant.release();
                    blocked.insert(entry.tenant_id.clone());
                    self.defer(entry);
                    continue;
                }
                entry.payload.needs_tokens = false;
            }

            self.queue.lock().mark_served(&entry);
            return Some((entry, tenant));
        }
    }

    /// Put a blocked entry back. Checked under the lock: a withdrawal that
    /// missed the entry while it was out of the queue has already flipped its
    /// state, and the entry is settled instead.
    fn defer(&self, entry: QueueEntry) {
        let withdrawn = {
            let mut queue = self.queue.lock();
            if entry.payload.slot.state() == RequestState::Queued {
                queue.requeue(entry);
                None
            } else {
                Some(entry)
            }
        };
        if let Some(entry) = withdrawn {
            self.settle_withdrawn(entry, Instant::now());
        }
    }

    async fn dispatch(&self, entry: QueueEntry, tenant: Arc<TenantState>, lease_id: LeaseId) {
        if !entry
            .payload
            .slot
            .transition(RequestState::Queued, RequestState::Dispatched)
        {
            // Withdrawn between the checks and now
            tenant.release();
            self.release_pool_lease(lease_id).await;
            self.settle_withdrawn(entry, Instant::now());
            return;
        }

        let now = Instant::now();
        let queued_for = now.saturating_duration_since(entry.arrived_at);
        let lease = PoolLease {
            lease_id,
            request_id: entry.request_id,
            tenant_id: entry.tenant_id,
            cost: entry.cost,
            dispatched_at: now,
            queued_for,
        };
        tenant.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters.dispatched(true);
        debug!(
            tenant_id = %lease.tenant_id,
            request_id = %lease.request_id,
            lease = %lease_id,
            virtual_finish = entry.virtual_finish_time,
            queued_ms = queued_for.as_millis() as u64,
            "Dispatched queued request"
        );

        if let Err(Ok(lease)) = entry.payload.sender.send(Ok(lease)) {
            // The caller went away between dispatch and delivery
            let _ = self.release_lease(lease).await;
        }
    }

    /// Deliver the outcome for an entry that left the queue without being
    /// dispatched: an expired entry times out here, otherwise the caller
    /// already moved it to `Cancelled` or `TimedOut`.
    fn settle_withdrawn(&self, entry: QueueEntry, now: Instant) {
        let request = entry.payload;
        request
            .slot
            .transition(RequestState::Queued, RequestState::TimedOut);

        let error = match request.slot.state() {
            RequestState::Cancelled => AdmissionError::Cancelled,
            _ => AdmissionError::Timeout {
                tenant_id: entry.tenant_id.clone(),
                waited: now.saturating_duration_since(entry.arrived_at),
            },
        };
        self.counters.rejected(&error);
        if error.kind() == RejectKind::Timeout {
            warn!(tenant_id = %entry.tenant_id, request_id = %entry.request_id, "Queued request timed out");
        } else {
            debug!(tenant_id = %entry.tenant_id, request_id = %entry.request_id, "Queued request cancelled");
        }
        let _ = request.sender.send(Err(error));
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired = self.queue.lock().remove_where(|entry| {
            entry.payload.deadline <= now || entry.payload.slot.state() != RequestState::Queued
        });
        for entry in expired {
            self.settle_withdrawn(entry, now);
        }
    }

    /// Reject every queued request with `error`
    fn fail_queued(&self, error: AdmissionError) {
        let entries = self.queue.lock().drain();
        let now = Instant::now();
        for entry in entries {
            if entry
                .payload
                .slot
                .transition(RequestState::Queued, RequestState::Rejected)
            {
                self.counters.rejected(&error);
                let _ = entry.payload.sender.send(Err(error.clone()));
            } else {
                self.settle_withdrawn(entry, now);
            }
        }
    }

    fn reject(&self, tenant_id: &str, slot: &RequestSlot, sender: OutcomeSender, error: AdmissionError) {
        let to = match error.kind() {
            RejectKind::Timeout => RequestState::TimedOut,
            _ => RequestState::Rejected,
        };
        slot.transition(RequestState::Arrived, to);
        self.counters.rejected(&error);

        match error.kind() {
            RejectKind::QueueFull | RejectKind::PoolUnavailable => {
                warn!(tenant_id = %tenant_id, "Request rejected: {}", error)
            }
            _ => debug!(tenant_id = %tenant_id, "Request rejected: {}", error),
        }
        let _ = sender.send(Err(error));
    }

    /// Return a dispatched lease: tenant in-flight slot first, then pool capacity
    async fn release_lease(&self, lease: PoolLease) -> Result<(), PoolError> {
        let tenant = self.tenant_state(&lease.tenant_id);
        if !tenant.release() {
            self.counters.invariant_violation();
            error!(tenant_id = %lease.tenant_id, lease = %lease.lease_id, "In-flight count underflow on lease release");
        }

        match self.pool.release(lease.lease_id).await {
            Ok(()) => {
                debug!(tenant_id = %lease.tenant_id, lease = %lease.lease_id, "Released lease");
                Ok(())
            }
            Err(e) => {
                self.invariant_violation(&e);
                Err(e)
            }
        }
    }

    /// Return a pool lease that was never attached to a request
    async fn release_pool_lease(&self, lease_id: LeaseId) {
        if let Err(e) = self.pool.release(lease_id).await {
            self.invariant_violation(&e);
        }
    }

    fn invariant_violation(&self, e: &PoolError) {
        self.counters.invariant_violation();
        error!("Lease accounting invariant violated: {}", e);
    }
}

impl QueueControl for Shared {
    fn withdraw(&self, request_id: &RequestId) {
        let removed = self.queue.lock().remove(request_id);
        if let Some(entry) = removed {
            self.settle_withdrawn(entry, Instant::now());
        }
    }

    fn reclaim(self: Arc<Self>, lease: PoolLease) {
        warn!(
            tenant_id = %lease.tenant_id,
            lease = %lease.lease_id,
            "Dispatched lease was never collected, releasing it"
        );
        AdmissionController { shared: self }.release_detached(lease);
    }
}

/// Completes the lease held by `serve` if the call is abandoned first
struct LeaseGuard {
    controller: AdmissionController,
    lease: Option<PoolLease>,
}

impl LeaseGuard {
    async fn complete(mut self) -> Result<(), PoolError> {
        match self.lease.take() {
            Some(lease) => self.controller.complete(lease).await,
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(
                tenant_id = %lease.tenant_id,
                lease = %lease.lease_id,
                "Serve abandoned before completion, releasing lease"
            );
            self.controller.release_detached(lease);
        }
    }
}

fn quota_exceeded(tenant_id: &str) -> AdmissionError {
    AdmissionError::QuotaExceeded {
        tenant_id: tenant_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_pool::StaticResourcePool;
    use pretty_assertions::assert_eq;

    fn controller(capacity: u32) -> (AdmissionController, Arc<StaticResourcePool>) {
        let pool = Arc::new(StaticResourcePool::new("test", capacity));
        let controller = AdmissionController::new(AdmissionConfig::default(), pool.clone()).unwrap();
        (controller, pool)
    }

    #[test]
    fn test_tenant_state_reserve_respects_quota() {
        let state = TenantState::default();
        assert!(state.try_reserve(2));
        assert!(state.try_reserve(2));
        assert!(!state.try_reserve(2));
        assert!(state.release());
        assert!(state.release());
        assert!(!state.release());
        assert_eq!(state.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_immediate_dispatch_and_complete() {
        let (controller, pool) = controller(2);

        let lease = controller
            .submit("tenant-1", 1.0, None)
            .await
            .outcome()
            .await
            .unwrap();

        assert_eq!(lease.tenant_id(), "tenant-1");
        assert_eq!(lease.queued_for(), Duration::ZERO);
        assert_eq!(pool.capacity().used, 1);
        assert_eq!(controller.tenant_usage("tenant-1").in_flight, 1);

        controller.complete(lease).await.unwrap();

        assert_eq!(pool.capacity().used, 0);
        assert_eq!(controller.tenant_usage("tenant-1").in_flight, 0);
        let stats = controller.stats();
        assert_eq!(stats.dispatched_immediately, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_invalid_cost_rejected() {
        let (controller, _) = controller(1);
        for cost in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let outcome = controller.submit("tenant-1", cost, None).await.outcome().await;
            assert_eq!(outcome.unwrap_err().kind(), RejectKind::InvalidCost);
        }
    }

    #[tokio::test]
    async fn test_strict_registration() {
        let pool = Arc::new(StaticResourcePool::new("test", 1));
        let config = AdmissionConfig {
            strict_registration: true,
            ..AdmissionConfig::default()
        };
        let controller = AdmissionController::new(config, pool).unwrap();

        let outcome = controller.submit("stranger", 1.0, None).await.outcome().await;
        assert_eq!(
            outcome.unwrap_err(),
            AdmissionError::UnknownTenant("stranger".to_string())
        );

        controller
            .register_tenant("member", TenantPolicy::default())
            .unwrap();
        let lease = controller
            .submit("member", 1.0, None)
            .await
            .outcome()
            .await
            .unwrap();
        controller.complete(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full() {
        let pool = Arc::new(StaticResourcePool::new("test", 1));
        let config = AdmissionConfig {
            max_queue_depth: 1,
            ..AdmissionConfig::default()
        };
        let controller = AdmissionController::new(config, pool).unwrap();

        let _lease = controller.submit("a", 1.0, None).await.outcome().await.unwrap();
        let queued = controller.submit("a", 1.0, None).await;
        assert_eq!(queued.state(), RequestState::Queued);

        let overflow = controller.submit("b", 1.0, None).await.outcome().await;
        assert_eq!(overflow.unwrap_err(), AdmissionError::QueueFull { depth: 1 });
        assert_eq!(controller.stats().rejected_queue_full, 1);
    }

    #[tokio::test]
    async fn test_past_deadline_times_out_without_queueing() {
        let (controller, _) = controller(1);
        let _lease = controller.submit("a", 1.0, None).await.outcome().await.unwrap();

        let outcome = controller
            .submit("a", 1.0, Some(Instant::now()))
            .await
            .outcome()
            .await;

        assert_eq!(outcome.unwrap_err().kind(), RejectKind::Timeout);
        assert_eq!(controller.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_queue() {
        let (controller, _) = controller(1);
        let lease = controller.submit("a", 1.0, None).await.outcome().await.unwrap();

        let handle = controller.submit("b", 1.0, None).await;
        assert_eq!(controller.queue_depth(), 1);
        drop(handle);
        assert_eq!(controller.queue_depth(), 0);

        controller.complete(lease).await.unwrap();
        assert_eq!(controller.capacity().used, 0);
        assert_eq!(controller.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_pool_unavailable() {
        let (controller, pool) = controller(1);
        pool.close();

        let outcome = controller.submit("a", 1.0, None).await.outcome().await;
        assert_eq!(outcome.unwrap_err(), AdmissionError::PoolUnavailable);
        assert_eq!(controller.stats().rejected_pool_unavailable, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_and_new_requests() {
        let (controller, _) = controller(1);
        controller.start();
        assert!(controller.is_running());

        let lease = controller.submit("a", 1.0, None).await.outcome().await.unwrap();
        let queued = controller.submit("b", 1.0, None).await;

        controller.shutdown().await;
        assert!(!controller.is_running());

        assert_eq!(queued.outcome().await.unwrap_err(), AdmissionError::ShuttingDown);
        let late = controller.submit("c", 1.0, None).await.outcome().await;
        assert_eq!(late.unwrap_err(), AdmissionError::ShuttingDown);

        // Outstanding work can still finish
        controller.complete(lease).await.unwrap();
        assert_eq!(controller.capacity().used, 0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let pool: Arc<dyn ResourcePool> = Arc::new(StaticResourcePool::new("test", 1));

        let no_sweep = AdmissionConfig {
            sweep_interval_ms: 0,
            ..AdmissionConfig::default()
        };
        assert!(matches!(
            AdmissionController::new(no_sweep, pool.clone()),
            Err(ConfigError::InvalidValue(_))
        ));

        let no_queue = AdmissionConfig {
            max_queue_depth: 0,
            ..AdmissionConfig::default()
        };
        assert!(matches!(
            AdmissionController::new(no_queue, pool),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_dispatched_handle_returns_lease() {
        let (controller, pool) = controller(1);

        let handle = controller.submit("a", 1.0, None).await;
        assert_eq!(handle.state(), RequestState::Dispatched);
        assert_eq!(pool.capacity().used, 1);
        drop(handle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.capacity().used, 0);
        assert_eq!(controller.tenant_usage("a").in_flight, 0);
        assert_eq!(controller.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_blocked_tenant_does_not_advance_virtual_time() {
        let (controller, pool) = controller(1);
        controller
            .register_tenant("a", TenantPolicy::default().with_max_in_flight(1))
            .unwrap();

        let holder = controller.submit("x", 1.0, None).await.outcome().await.unwrap();
        let mut queued = Vec::new();
        for _ in 0..3 {
            queued.push(controller.submit("a", 1.0, None).await);
        }
        controller.complete(holder).await.unwrap();
        let first = queued.remove(0).try_outcome().unwrap().unwrap();
        assert_eq!(controller.stats().virtual_time, 1.0);

        // Spare capacity, but every waiting entry belongs to a tenant at quota
        pool.resize(2);
        controller.dispatch_pending().await;
        assert_eq!(controller.queue_depth(), 2);
        assert_eq!(pool.capacity().used, 1);
        assert_eq!(controller.stats().virtual_time, 1.0);

        // A newcomer is tagged from the unchanged clock and passes the blocked tenant
        let mut other = controller.submit("b", 1.0, None).await;
        let lease = other.try_outcome().unwrap().unwrap();
        assert_eq!(lease.tenant_id(), "b");
        assert_eq!(controller.stats().virtual_time, 2.0);
        assert_eq!(controller.queue_depth(), 2);

        controller.complete(lease).await.unwrap();
        controller.complete(first).await.unwrap();
        assert_eq!(controller.tenant_usage("a").in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_loop_ends_with_the_controller() {
        let (controller, _) = controller(1);
        controller.start();
        assert!(controller.is_running());
        tokio::time::sleep(Duration::from_millis(1)).await;

        let shared = Arc::downgrade(&controller.shared);
        drop(controller);
        assert!(shared.upgrade().is_none());
    }
}
