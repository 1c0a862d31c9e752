//! Error types for admission, pool accounting and policy validation

use std::time::Duration;

use crate::types::{LeaseId, TenantId};

/// Why a request did not reach `Dispatched`
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("Tenant {tenant_id} is at its concurrent request quota")]
    QuotaExceeded { tenant_id: TenantId },

    #[error("Tenant {tenant_id} exceeded its request rate")]
    RateLimited { tenant_id: TenantId },

    #[error("Request for tenant {tenant_id} timed out after {waited:?} in queue")]
    Timeout { tenant_id: TenantId, waited: Duration },

    #[error("Resource pool unavailable")]
    PoolUnavailable,

    #[error("Unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("Admission queue full ({depth} requests waiting)")]
    QueueFull { depth: usize },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request cost: {0}")]
    InvalidCost(f64),

    #[error("Admission controller is shutting down")]
    ShuttingDown,
}

/// Stable discriminant of an [`AdmissionError`], for retry policies and stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    QuotaExceeded,
    RateLimited,
    Timeout,
    PoolUnavailable,
    UnknownTenant,
    QueueFull,
    Cancelled,
    InvalidCost,
    ShuttingDown,
}

impl AdmissionError {
    pub fn kind(&self) -> RejectKind {
        match self {
            AdmissionError::QuotaExceeded { .. } => RejectKind::QuotaExceeded,
            AdmissionError::RateLimited { .. } => RejectKind::RateLimited,
            AdmissionError::Timeout { .. } => RejectKind::Timeout,
            AdmissionError::PoolUnavailable => RejectKind::PoolUnavailable,
            AdmissionError::UnknownTenant(_) => RejectKind::UnknownTenant,
            AdmissionError::QueueFull { .. } => RejectKind::QueueFull,
            AdmissionError::Cancelled => RejectKind::Cancelled,
            AdmissionError::InvalidCost(_) => RejectKind::InvalidCost,
            AdmissionError::ShuttingDown => RejectKind::ShuttingDown,
        }
    }

    /// Whether retrying the same request later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            RejectKind::QuotaExceeded
                | RejectKind::RateLimited
                | RejectKind::Timeout
                | RejectKind::PoolUnavailable
                | RejectKind::QueueFull
        )
    }
}

/// Resource pool adapter errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Resource pool is closed")]
    Closed,

    #[error("Lease {0} is not outstanding (double release or foreign lease)")]
    UnknownLease(LeaseId),
}

/// Tenant policy validation errors
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Tenant id must not be empty")]
    EmptyTenantId,

    #[error("Tenant weight must be positive")]
    ZeroWeight,

    #[error("Tenant quota (max_in_flight) must be positive")]
    ZeroQuota,

    #[error("Invalid sustained rate: {0}")]
    InvalidRate(f64),

    #[error("Invalid burst size: {0}")]
    InvalidBurst(f64),
}
