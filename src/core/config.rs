//! Store configuration loaded from `<root>/partyledger.toml`.
//!
//! Every key is optional; a missing file yields [`LedgerConfig::default`].

use crate::core::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "partyledger.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerPolicy,
    pub audit: AuditConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub max_busy_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ledger.db"),
            busy_timeout_ms: 5_000,
            max_busy_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerPolicy {
    /// Clear a party's `active` flag when its budget reaches zero.
    pub deactivate_on_exhaustion: bool,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            deactivate_on_exhaustion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("ledger.events.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn parse(content: &str) -> Result<Self, LedgerError> {
        let config: LedgerConfig =
            toml::from_str(content).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(LedgerError::Config("database.path must not be empty".into()));
        }
        if self.audit.enabled && self.audit.path.as_os_str().is_empty() {
            return Err(LedgerError::Config(
                "audit.path must not be empty when auditing is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Load `partyledger.toml` from the store root. No file means defaults.
pub fn load_config(root: &Path) -> Result<LedgerConfig, LedgerError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(LedgerConfig::default());
    }
    let content = fs::read_to_string(&config_path)?;
    LedgerConfig::parse(&content)
}

/// Resolve a configured path against the store root unless it is already absolute.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}
