//! Core Types
//!
//! Identifiers and per-tenant policy shared by every admission component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::PolicyError;

/// Tenant identifier type
pub type TenantId = String;

/// Logical cost of a request, in tokens and in fair-queue service units
pub type Cost = f64;

/// Cost charged when the caller does not supply one
pub const DEFAULT_COST: Cost = 1.0;

/// Unique identifier of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one occupied capacity unit in a resource pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(u64);

impl LeaseId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Rate-limit parameters for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimit {
    /// No rate limit; the token bucket is bypassed entirely
    #[default]
    Unlimited,
    /// Sustained `rate_per_sec` tokens per second with at most `burst` tokens banked
    TokenBucket { rate_per_sec: f64, burst: f64 },
}

impl RateLimit {
    pub fn per_second(rate_per_sec: f64, burst: f64) -> Self {
        RateLimit::TokenBucket {
            rate_per_sec,
            burst,
        }
    }

    /// An infinite sustained rate behaves exactly like `Unlimited`
    pub fn is_unlimited(&self) -> bool {
        match self {
            RateLimit::Unlimited => true,
            RateLimit::TokenBucket { rate_per_sec, .. } => rate_per_sec.is_infinite(),
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        match *self {
            RateLimit::Unlimited => Ok(()),
            RateLimit::TokenBucket {
                rate_per_sec,
                burst,
            } => {
                if rate_per_sec.is_nan() || rate_per_sec <= 0.0 {
                    return Err(PolicyError::InvalidRate(rate_per_sec));
                }
                if !burst.is_finite() || burst <= 0.0 {
                    return Err(PolicyError::InvalidBurst(burst));
                }
                Ok(())
            }
        }
    }
}

/// Admission policy for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    /// Share of dispatch bandwidth relative to other tenants
    pub weight: u32,
    /// Maximum concurrently dispatched requests
    pub max_in_flight: u32,
    pub rate: RateLimit,
    /// Longest a request may sit in the fair queue
    pub max_wait_ms: u64,
    /// Queue instead of rejecting when the token bucket is empty
    pub queue_on_rate_limit: bool,
}

impl TenantPolicy {
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_rate(mut self, rate: RateLimit) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = max_wait.as_millis() as u64;
        self
    }

    pub fn with_queue_on_rate_limit(mut self, enabled: bool) -> Self {
        self.queue_on_rate_limit = enabled;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.weight == 0 {
            return Err(PolicyError::ZeroWeight);
        }
        if self.max_in_flight == 0 {
            return Err(PolicyError::ZeroQuota);
        }
        self.rate.validate()
    }
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            weight: 1,
            max_in_flight: 16,
            rate: RateLimit::Unlimited,
            max_wait_ms: 30_000,
            queue_on_rate_limit: false,
        }
    }
}
