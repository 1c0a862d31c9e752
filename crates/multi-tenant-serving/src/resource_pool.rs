//! Resource Pool Module
//!
//! The capacity source the admission controller draws from. Implementations
//! may hand out worker slots, connections or remote capacity leases; the
//! controller only relies on acquire/release being linearizable.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, info};

use crate::error::PoolError;
use crate::types::LeaseId;

/// Occupied and total capacity units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCapacity {
    pub used: u32,
    pub total: u32,
}

impl PoolCapacity {
    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.used)
    }
}

/// Shared backend capacity.
///
/// A lease returned by `try_acquire` is never handed out again until it is
/// released, and a released lease is immediately available to the next
/// acquire. `release` of a lease that is not outstanding must fail with
/// [`PoolError::UnknownLease`] and leave accounting untouched.
#[async_trait]
pub trait ResourcePool: Send + Sync + std::fmt::Debug {
    /// Claim one capacity unit; `Ok(None)` when the pool is full,
    /// `Err(PoolError::Closed)` when it cannot serve at all
    async fn try_acquire(&self) -> Result<Option<LeaseId>, PoolError>;

    async fn release(&self, lease: LeaseId) -> Result<(), PoolError>;

    fn capacity(&self) -> PoolCapacity;
}

#[derive(Debug)]
struct PoolState {
    total: u32,
    outstanding: HashSet<LeaseId>,
    next_lease: u64,
    closed: bool,
}

/// Fixed-size in-process pool of interchangeable slots
#[derive(Debug)]
pub struct StaticResourcePool {
    name: String,
    state: Mutex<PoolState>,
}

impl StaticResourcePool {
    pub fn new(name: impl Into<String>, total: u32) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PoolState {
                total,
                outstanding: HashSet::new(),
                next_lease: 1,
                closed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change total capacity. Shrinking below the outstanding count never
    /// revokes leases; new acquires fail until enough are released.
    pub fn resize(&self, total: u32) {
        let mut state = self.state.lock();
        let previous = state.total;
        state.total = total;
        info!(pool_name = %self.name, previous, total, "Resized resource pool");
    }

    /// Stop handing out leases; outstanding leases can still be released
    pub fn close(&self) {
        self.state.lock().closed = true;
        info!(pool_name = %self.name, "Resource pool closed");
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
        info!(pool_name = %self.name, "Resource pool reopened");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl ResourcePool for StaticResourcePool {
    async fn try_acquire(&self) -> Result<Option<LeaseId>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.outstanding.len() as u32 >= state.total {
            return Ok(None);
        }
        let lease = LeaseId::new(state.next_lease);
        state.next_lease += 1;
        state.outstanding.insert(lease);
        Ok(Some(lease))
    }

    async fn release(&self, lease: LeaseId) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if !state.outstanding.remove(&lease) {
            error!(pool_name = %self.name, %lease, "Release of a lease that is not outstanding");
            return Err(PoolError::UnknownLease(lease));
        }
        Ok(())
    }

    fn capacity(&self) -> PoolCapacity {
        let state = self.state.lock();
        PoolCapacity {
            used: state.outstanding.len() as u32,
            total: state.total,
        }
    }
}
