//! Shared, serialized access to the SQLite store.
//!
//! Every balance-affecting write takes this mutex for the duration of its
//! transaction. A single guarded connection gives full serializability,
//! which is how this deployment satisfies the row-locking contract a
//! PostgreSQL deployment would get from `SELECT ... FOR UPDATE` (see
//! SPEC_FULL.md §2.1 and §5).

pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Clone)]
pub struct Db {
    pub conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;

        conn.execute_batch(schema::SCHEMA_SQL)
            .context("applying schema")?;
        conn.execute_batch(schema::OVERSELL_TRIGGER_SQL)
            .context("installing oversell trigger")?;
        conn.execute_batch(schema::SEED_SQL)
            .context("seeding fixed classifiers")?;

        info!(path, "database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("applying schema")?;
        conn.execute_batch(schema::OVERSELL_TRIGGER_SQL)
            .context("installing oversell trigger")?;
        conn.execute_batch(schema::SEED_SQL)
            .context("seeding fixed classifiers")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_applies_schema() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn.blocking_lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='operations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
