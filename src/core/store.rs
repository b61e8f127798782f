//! Store handle for a partyledger workspace.
//!
//! A store is a directory holding the ledger database, the audit log and an
//! optional `partyledger.toml`. All subsystems (catalog, parties, users,
//! orders) operate on one store.

use crate::core::config::{self, LedgerConfig};
use crate::core::error::LedgerError;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    pub config: LedgerConfig,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root` and load its config.
    pub fn open(root: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(root)?;
        let config = config::load_config(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn with_config(root: &Path, config: LedgerConfig) -> Result<Self, LedgerError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        config::resolve(&self.root, &self.config.database.path)
    }

    /// `None` when auditing is disabled.
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        self.config
            .audit
            .enabled
            .then(|| config::resolve(&self.root, &self.config.audit.path))
    }
}
