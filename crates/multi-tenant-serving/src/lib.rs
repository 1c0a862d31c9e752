//! Multi-Tenant Serving
//!
//! Admission control in front of a shared pool of serving capacity: per
//! tenant concurrency quotas, token-bucket rate limits and weighted fair
//! queuing of the requests that cannot be dispatched right away.

pub mod admission_controller;
pub mod config;
pub mod error;
pub mod plugin;
pub mod request;
pub mod resource_pool;
pub mod stats;
pub mod telemetry;
pub mod tenant_registry;
pub mod token_bucket;
pub mod types;
pub mod weighted_fair_queuing;

// Re-exports
pub use admission_controller::AdmissionController;
pub use config::{AdmissionConfig, ConfigError, LoggingConfig, PoolConfig, ServingConfig, TenantConfig};
pub use error::{AdmissionError, PolicyError, PoolError, RejectKind};
pub use plugin::{MultiTenantServingPlugin, PluginError};
pub use request::{PoolLease, RequestHandle, RequestState};
pub use resource_pool::{PoolCapacity, ResourcePool, StaticResourcePool};
pub use stats::{AdmissionStats, TenantUsage, fairness_index};
pub use tenant_registry::{RegistryError, TenantRecord, TenantRegistry};
pub use token_bucket::{RateLimiter, TokenBucket};
pub use types::{Cost, DEFAULT_COST, LeaseId, RateLimit, RequestId, TenantId, TenantPolicy};
pub use weighted_fair_queuing::{FairQueueEntry, WFQStats, WeightedFairQueue};
