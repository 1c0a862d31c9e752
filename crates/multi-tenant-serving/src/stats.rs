//! Admission statistics
//!
//! Lock-free counters updated on the hot path, plus snapshot types returned
//! to callers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AdmissionError, RejectKind};
use crate::resource_pool::PoolCapacity;
use crate::types::TenantId;

#[derive(Debug, Default)]
pub(crate) struct AdmissionCounters {
    submitted: AtomicU64,
    dispatched_immediately: AtomicU64,
    dispatched_from_queue: AtomicU64,
    queued: AtomicU64,
    rejected_quota: AtomicU64,
    rejected_rate: AtomicU64,
    rejected_pool_unavailable: AtomicU64,
    rejected_unknown_tenant: AtomicU64,
    rejected_queue_full: AtomicU64,
    rejected_other: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    invariant_violations: AtomicU64,
}

impl AdmissionCounters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dispatched(&self, from_queue: bool) {
        let counter = if from_queue {
            &self.dispatched_from_queue
        } else {
            &self.dispatched_immediately
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self, error: &AdmissionError) {
        let counter = match error.kind() {
            RejectKind::QuotaExceeded => &self.rejected_quota,
            RejectKind::RateLimited => &self.rejected_rate,
            RejectKind::PoolUnavailable => &self.rejected_pool_unavailable,
            RejectKind::UnknownTenant => &self.rejected_unknown_tenant,
            RejectKind::QueueFull => &self.rejected_queue_full,
            RejectKind::Timeout => &self.timed_out,
            RejectKind::Cancelled => &self.cancelled,
            RejectKind::InvalidCost | RejectKind::ShuttingDown => &self.rejected_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        queue_depth: usize,
        virtual_time: f64,
        pool: PoolCapacity,
    ) -> AdmissionStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AdmissionStats {
            submitted: load(&self.submitted),
            dispatched_immediately: load(&self.dispatched_immediately),
            dispatched_from_queue: load(&self.dispatched_from_queue),
            queued: load(&self.queued),
            rejected_quota: load(&self.rejected_quota),
            rejected_rate: load(&self.rejected_rate),
            rejected_pool_unavailable: load(&self.rejected_pool_unavailable),
            rejected_unknown_tenant: load(&self.rejected_unknown_tenant),
            rejected_queue_full: load(&self.rejected_queue_full),
            rejected_other: load(&self.rejected_other),
            timed_out: load(&self.timed_out),
            cancelled: load(&self.cancelled),
            completed: load(&self.completed),
            invariant_violations: load(&self.invariant_violations),
            queue_depth: queue_depth as u64,
            virtual_time,
            pool,
        }
    }
}

/// Point-in-time admission statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub submitted: u64,
    pub dispatched_immediately: u64,
    pub dispatched_from_queue: u64,
    pub queued: u64,
    pub rejected_quota: u64,
    pub rejected_rate: u64,
    pub rejected_pool_unavailable: u64,
    pub rejected_unknown_tenant: u64,
    pub rejected_queue_full: u64,
    pub rejected_other: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub completed: u64,
    /// Double releases and in-flight underflows reported by lease accounting
    pub invariant_violations: u64,
    pub queue_depth: u64,
    pub virtual_time: f64,
    pub pool: PoolCapacity,
}

impl AdmissionStats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched_immediately + self.dispatched_from_queue
    }
}

/// Per-tenant usage snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub tenant_id: TenantId,
    pub in_flight: u32,
    pub dispatched_total: u64,
    pub queued: usize,
    /// `None` for tenants without a rate limit
    pub tokens_available: Option<f64>,
}

/// Jain's fairness index over `(weight, dispatched)` samples.
///
/// Each tenant's dispatch count is normalised by its weight first, so 1.0
/// means every tenant was served exactly in proportion to its weight.
pub fn fairness_index(samples: &[(u32, u64)]) -> f64 {
    let shares: Vec<f64> = samples
        .iter()
        .filter(|(weight, _)| *weight > 0)
        .map(|(weight, dispatched)| *dispatched as f64 / f64::from(*weight))
        .collect();

    if shares.is_empty() {
        return 1.0;
    }

    let sum: f64 = shares.iter().sum();
    let sum_squared: f64 = shares.iter().map(|s| s * s).sum();
    if sum_squared == 0.0 {
        return 1.0;
    }

    (sum * sum) / (shares.len() as f64 * sum_squared)
}
