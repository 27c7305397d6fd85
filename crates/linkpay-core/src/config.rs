//! Protocol configuration loading and management.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;
use crate::types::AssetId;

/// Configuration for the linked-transfer protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How long to wait for an install or reject event after proposing (ms).
    #[serde(default = "default_install_timeout_ms")]
    pub install_timeout_ms: u64,

    /// How long to wait for a collateral deposit to land (ms).
    #[serde(default = "default_collateral_timeout_ms")]
    pub collateral_timeout_ms: u64,

    /// Lease slack added on top of the bounded waits a protocol operation
    /// performs while holding a channel lock (ms).
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// How long a caller blocks waiting for a held channel lock (ms).
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,

    /// Wall-clock budget for retrying retryable failures (ms).
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,

    /// Pause between retries (ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Period of the background reclaim sweep (ms).
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    /// Per-asset collateralization targets.
    #[serde(default)]
    pub collateral_profiles: Vec<CollateralProfile>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How much liquidity the router keeps in a user's channel for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralProfile {
    pub asset_id: AssetId,
    /// Target router balance after a top-up.
    pub amount_to_collateralize: u64,
    /// Router balance below which a top-up is due.
    pub minimum_maintained_collateral: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_install_timeout_ms() -> u64 {
    15_000
}
fn default_collateral_timeout_ms() -> u64 {
    30_000
}
fn default_lock_lease_ms() -> u64 {
    10_000
}
fn default_lock_acquire_timeout_ms() -> u64 {
    20_000
}
fn default_retry_budget_ms() -> u64 {
    60_000
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_reclaim_interval_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            install_timeout_ms: default_install_timeout_ms(),
            collateral_timeout_ms: default_collateral_timeout_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
            retry_budget_ms: default_retry_budget_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            collateral_profiles: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ProtocolConfig {
    /// Load config from a TOML file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, CoreError> {
        toml::from_str(contents).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Config(format!("create {}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, contents)
            .map_err(|e| CoreError::Config(format!("write {}: {}", path.display(), e)))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn collateral_timeout(&self) -> Duration {
        Duration::from_millis(self.collateral_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Lease taken by protocol operations. It spans every bounded wait an
    /// operation can perform while holding a channel, with `lock_lease` on
    /// top for the unbounded engine and ledger calls around them.
    pub fn operation_lease(&self) -> Duration {
        self.lock_lease() + self.collateral_timeout() + self.install_timeout()
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// The collateral profile for `asset_id`, if one is configured.
    pub fn collateral_profile(&self, asset_id: &AssetId) -> Option<&CollateralProfile> {
        self.collateral_profiles
            .iter()
            .find(|p| p.asset_id == *asset_id)
    }
}
