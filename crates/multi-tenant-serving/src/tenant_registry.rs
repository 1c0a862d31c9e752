//! Tenant Registry Module
//!
//! Tracks known tenants and their admission policies. Readers always see a
//! complete policy snapshot: the tenant table is copy-on-write and swapped
//! atomically on every registration or update, so a lookup racing with an
//! update observes either the old or the new policy, never a mix.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::PolicyError;
use crate::types::{TenantId, TenantPolicy};

/// A registered tenant
#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub policy: Arc<TenantPolicy>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registry error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("Tenant {0} already exists")]
    AlreadyRegistered(TenantId),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
}

type TenantTable = HashMap<TenantId, Arc<TenantRecord>>;

#[derive(Debug)]
pub struct TenantRegistry {
    tenants: ArcSwap<TenantTable>,
    default_policy: ArcSwap<TenantPolicy>,
    strict: bool,
}

impl TenantRegistry {
    /// Create a registry that falls back to `default_policy` for unknown tenants
    pub fn new(default_policy: TenantPolicy) -> Self {
        Self {
            tenants: ArcSwap::from_pointee(HashMap::new()),
            default_policy: ArcSwap::from_pointee(default_policy),
            strict: false,
        }
    }

    /// Create a registry that only knows explicitly registered tenants
    pub fn strict(default_policy: TenantPolicy) -> Self {
        Self {
            strict: true,
            ..Self::new(default_policy)
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Register a new tenant; fails if the tenant already exists
    pub fn register(&self, tenant_id: &str, policy: TenantPolicy) -> Result<(), RegistryError> {
        validate(tenant_id, &policy)?;

        if self.tenants.load().contains_key(tenant_id) {
            return Err(RegistryError::AlreadyRegistered(tenant_id.to_string()));
        }

        let now = Utc::now();
        let record = Arc::new(TenantRecord {
            tenant_id: tenant_id.to_string(),
            policy: Arc::new(policy),
            registered_at: now,
            updated_at: now,
        });

        let mut duplicate = false;
        self.tenants.rcu(|current| {
            let mut next = TenantTable::clone(current);
            duplicate = next.contains_key(tenant_id);
            if !duplicate {
                next.insert(tenant_id.to_string(), record.clone());
            }
            next
        });
        if duplicate {
            return Err(RegistryError::AlreadyRegistered(tenant_id.to_string()));
        }

        info!(tenant_id = %tenant_id, "Registered tenant");
        Ok(())
    }

    /// Replace the policy of an existing tenant
    pub fn update(&self, tenant_id: &str, policy: TenantPolicy) -> Result<(), RegistryError> {
        validate(tenant_id, &policy)?;

        let policy = Arc::new(policy);
        let mut found = false;
        self.tenants.rcu(|current| {
            let mut next = TenantTable::clone(current);
            found = match current.get(tenant_id) {
                Some(existing) => {
                    next.insert(
                        tenant_id.to_string(),
                        Arc::new(TenantRecord {
                            policy: policy.clone(),
                            updated_at: Utc::now(),
                            ..TenantRecord::clone(existing)
                        }),
                    );
                    true
                }
                None => false,
            };
            next
        });

        if !found {
            return Err(RegistryError::TenantNotFound(tenant_id.to_string()));
        }

        info!(tenant_id = %tenant_id, "Updated tenant policy");
        Ok(())
    }

    /// Register or update, whichever applies
    pub fn upsert(&self, tenant_id: &str, policy: TenantPolicy) -> Result<(), RegistryError> {
        match self.update(tenant_id, policy.clone()) {
            Err(RegistryError::TenantNotFound(_)) => match self.register(tenant_id, policy.clone()) {
                // Lost a race with a concurrent register; apply as an update
                Err(RegistryError::AlreadyRegistered(_)) => self.update(tenant_id, policy),
                other => other,
            },
            other => other,
        }
    }

    /// Policy for `tenant_id`, or the default policy when it is not registered
    pub fn lookup(&self, tenant_id: &str) -> Arc<TenantPolicy> {
        match self.tenants.load().get(tenant_id) {
            Some(record) => record.policy.clone(),
            None => {
                debug!(tenant_id = %tenant_id, "Unknown tenant, using default policy");
                self.default_policy.load_full()
            }
        }
    }

    /// Registered record for `tenant_id`, if any
    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantRecord>> {
        self.tenants.load().get(tenant_id).cloned()
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.tenants.load().contains_key(tenant_id)
    }

    pub fn default_policy(&self) -> Arc<TenantPolicy> {
        self.default_policy.load_full()
    }

    pub fn set_default_policy(&self, policy: TenantPolicy) -> Result<(), RegistryError> {
        policy.validate()?;
        self.default_policy.store(Arc::new(policy));
        info!("Updated default tenant policy");
        Ok(())
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tenants.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new(TenantPolicy::default())
    }
}

fn validate(tenant_id: &str, policy: &TenantPolicy) -> Result<(), RegistryError> {
    if tenant_id.is_empty() {
        return Err(PolicyError::EmptyTenantId.into());
    }
    policy.validate()?;
    Ok(())
}
