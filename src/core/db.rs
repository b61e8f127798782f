use crate::core::broker::DbBroker;
use crate::core::error::LedgerError;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, OptionalExtension};
use std::time::Duration;

pub fn db_connect(db_path: &str, busy_timeout: Duration) -> Result<Connection, LedgerError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

/// Create every ledger table and record the schema version. Idempotent.
pub fn initialize_ledger_db(store: &Store) -> Result<(), LedgerError> {
    let broker = DbBroker::new(store);
    broker.with_tx("system", None, "ledger.init", |tx| {
        for ddl in schemas::LEDGER_DB_TABLES {
            tx.execute(ddl, [])?;
        }
        for ddl in schemas::LEDGER_DB_SCHEMA_INDEXES {
            tx.execute(ddl, [])?;
        }
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => {
                tx.execute(
                    "INSERT INTO meta(key, value) VALUES('schema_version', ?1)",
                    [schemas::LEDGER_SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == schemas::LEDGER_SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(LedgerError::Internal(format!(
                    "unsupported ledger schema version {} (expected {})",
                    v,
                    schemas::LEDGER_SCHEMA_VERSION
                )));
            }
        }
        Ok(())
    })?;
    tracing::debug!(db = %store.db_path().display(), "ledger database initialized");
    Ok(())
}
