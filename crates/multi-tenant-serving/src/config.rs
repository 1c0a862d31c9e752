//! Serving Configuration
//!
//! Configuration is read from a YAML file (`MTS_CONFIG_PATH`), inline YAML
//! (`MTS_CONFIG_YAML`) or, when neither is set, individual environment
//! variables. Every loaded configuration is validated before use.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PolicyError;
use crate::types::{TenantId, TenantPolicy};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServingConfig {
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
    /// Tenants registered at startup
    pub tenants: Vec<TenantConfig>,
    pub logging: LoggingConfig,
}

impl ServingConfig {
    /// Load configuration from file, inline YAML or environment
    pub fn load() -> Result<Self> {
        let config = match (
            std::env::var("MTS_CONFIG_PATH").ok(),
            std::env::var("MTS_CONFIG_YAML").ok(),
        ) {
            (Some(path), None) => Self::from_file(PathBuf::from(path))?,
            (None, Some(yaml)) => Self::from_yaml(&yaml)?,
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidValue(
                    "set only one of MTS_CONFIG_PATH and MTS_CONFIG_YAML".to_string(),
                ))
            }
            (None, None) => Self::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path));
        }
        let content = std::fs::read_to_string(&path).map_err(ConfigError::FileRead)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(ConfigError::ParseYaml)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            pool: PoolConfig::from_env()?,
            admission: AdmissionConfig::from_env()?,
            tenants: Vec::new(),
            logging: LoggingConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.admission.validate()?;

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(ConfigError::InvalidPolicy {
                    tenant_id: tenant.id.clone(),
                    source: PolicyError::EmptyTenantId,
                });
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "tenant {} configured more than once",
                    tenant.id
                )));
            }
            tenant
                .policy
                .validate()
                .map_err(|source| ConfigError::InvalidPolicy {
                    tenant_id: tenant.id.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// Resource pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of concurrently dispatchable capacity units
    pub capacity: u32,
}

impl PoolConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            capacity: env_or("MTS_POOL_CAPACITY", 8)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "pool capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 8 }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Policy applied to tenants that were never registered
    pub default_policy: TenantPolicy,
    /// Reject unregistered tenants with `UnknownTenant`
    pub strict_registration: bool,
    pub max_queue_depth: usize,
    /// Interval of the background deadline sweep and retry pass
    pub sweep_interval_ms: u64,
}

impl AdmissionConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = TenantPolicy::default();
        let default_policy = TenantPolicy {
            weight: env_or("MTS_DEFAULT_WEIGHT", defaults.weight)?,
            max_in_flight: env_or("MTS_DEFAULT_QUOTA", defaults.max_in_flight)?,
            max_wait_ms: env_or("MTS_DEFAULT_MAX_WAIT_MS", defaults.max_wait_ms)?,
            ..defaults
        };

        Ok(Self {
            default_policy,
            strict_registration: env_or("MTS_STRICT_REGISTRATION", false)?,
            max_queue_depth: env_or("MTS_MAX_QUEUE_DEPTH", 10_000)?,
            sweep_interval_ms: env_or("MTS_SWEEP_INTERVAL_MS", 50)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "max_queue_depth must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_ms must be > 0".to_string(),
            ));
        }
        self.default_policy
            .validate()
            .map_err(|source| ConfigError::InvalidPolicy {
                tenant_id: "<default>".to_string(),
                source,
            })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_policy: TenantPolicy::default(),
            strict_registration: false,
            max_queue_depth: 10_000,
            sweep_interval_ms: 50,
        }
    }
}

/// A tenant registered from configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantConfig {
    pub id: TenantId,
    #[serde(default)]
    pub policy: TenantPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,

    /// Log format: `json` or `pretty`
    pub format: String,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let level = std::env::var("MTS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let format = std::env::var("MTS_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

        Ok(Self { level, format })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    FileRead(std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseYaml(serde_yaml::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Invalid policy for tenant {tenant_id}: {source}")]
    InvalidPolicy {
        tenant_id: TenantId,
        source: PolicyError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
