use crate::core::db;
use crate::core::error::LedgerError;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 25;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 2_000;

/// The DB Broker is the single path to ledger state.
///
/// Reads get a fresh connection. Writes run inside a SQLite `IMMEDIATE`
/// transaction, so the write lock is taken before the first read of the
/// closure and concurrent writers, in-process or not, serialize on the
/// database itself. A busy failure rolls the whole closure back and it is
/// retried from scratch with backoff. Every write is recorded in the JSONL
/// audit log.
pub struct DbBroker {
    db_path: PathBuf,
    audit_log_path: Option<PathBuf>,
    busy_timeout: Duration,
    max_busy_retries: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
    pub attempts: u32,
}

impl DbBroker {
    pub fn new(store: &Store) -> Self {
        Self {
            db_path: store.db_path(),
            audit_log_path: store.audit_log_path(),
            busy_timeout: Duration::from_millis(store.config.database.busy_timeout_ms),
            max_busy_retries: store.config.database.max_busy_retries,
        }
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        db::db_connect(&self.db_path.to_string_lossy(), self.busy_timeout)
    }

    /// Execute a read-only closure. WAL mode lets readers run alongside writers.
    pub fn with_read<F, R>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, LedgerError>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Execute a closure inside one `IMMEDIATE` transaction.
    ///
    /// `Ok` commits, `Err` rolls back. Nothing the closure wrote is visible
    /// unless it returned `Ok` and the commit succeeded.
    pub fn with_tx<F, R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        mut f: F,
    ) -> Result<R, LedgerError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, LedgerError>,
    {
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            match self.run_tx_once(&mut f) {
                Err(e) if e.is_busy() && attempts <= self.max_busy_retries => {
                    let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempts - 1)).min(MAX_DELAY_MS);
                    tracing::debug!(op = op_name, attempts, delay_ms, "database busy, retrying");
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                other => break other,
            }
        };

        // The outcome is already decided; an audit failure must not change it.
        let status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self.log_event(actor, intent_ref, op_name, status, attempts) {
            tracing::error!(op = op_name, status, error = %e, "audit log write failed");
        }
        result
    }

    fn run_tx_once<F, R>(&self, f: &mut F) -> Result<R, LedgerError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, LedgerError>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Dropping `tx` on the error path rolls back.
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        status: &str,
        attempts: u32,
    ) -> Result<(), LedgerError> {
        let Some(path) = &self.audit_log_path else {
            return Ok(());
        };
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: self
                .db_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            status: status.to_string(),
            attempts,
        };
        let line = serde_json::to_string(&ev)
            .map_err(|e| LedgerError::Internal(format!("audit encode: {}", e)))?;

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All audit events recorded so far, oldest first.
    pub fn read_events(&self) -> Result<Vec<BrokerEvent>, LedgerError> {
        let Some(path) = &self.audit_log_path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| LedgerError::Internal(format!("corrupt audit line: {}", e)))
            })
            .collect()
    }
}
