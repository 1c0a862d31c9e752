//! Plugin lifecycle
//!
//! Wires configuration, logging, the static pool and the admission
//! controller together for a host process.

use std::sync::Arc;
use tracing::info;

use crate::admission_controller::AdmissionController;
use crate::config::{ConfigError, ServingConfig};
use crate::resource_pool::StaticResourcePool;
use crate::telemetry::init_tracing;
use crate::tenant_registry::RegistryError;

pub const PLUGIN_NAME: &str = "multi-tenant-serving";

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin already initialized")]
    AlreadyInitialized,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tenant registration failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Host-facing entry point of the admission layer
#[derive(Debug)]
pub struct MultiTenantServingPlugin {
    name: &'static str,
    version: &'static str,
    controller: Option<AdmissionController>,
    pool: Option<Arc<StaticResourcePool>>,
}

impl MultiTenantServingPlugin {
    pub fn new() -> Self {
        Self {
            name: PLUGIN_NAME,
            version: env!("CARGO_PKG_VERSION"),
            controller: None,
            pool: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn version(&self) -> &str {
        self.version
    }

    /// Validate `config`, install logging, build the pool, register the
    /// configured tenants and start the dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(&mut self, config: ServingConfig) -> Result<(), PluginError> {
        if self.controller.is_some() {
            return Err(PluginError::AlreadyInitialized);
        }
        config.validate()?;
        init_tracing(&config.logging);

        let pool = Arc::new(StaticResourcePool::new(PLUGIN_NAME, config.pool.capacity));
        let controller = AdmissionController::new(config.admission, pool.clone())?;
        for tenant in &config.tenants {
            controller.register_tenant(&tenant.id, tenant.policy.clone())?;
        }
        controller.start();

        info!(
            plugin = self.name,
            version = self.version,
            pool_capacity = config.pool.capacity,
            tenants = config.tenants.len(),
            "Initialized plugin"
        );

        self.pool = Some(pool);
        self.controller = Some(controller);
        Ok(())
    }

    /// Running controller, if initialized
    pub fn controller(&self) -> Option<AdmissionController> {
        self.controller.clone()
    }

    pub fn pool(&self) -> Option<Arc<StaticResourcePool>> {
        self.pool.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.controller.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.shutdown().await;
            info!(plugin = self.name, "Plugin shut down");
        }
        self.pool = None;
    }
}

impl Default for MultiTenantServingPlugin {
    fn default() -> Self {
        Self::new()
    }
}
