//! SQLite-backed store for access tokens, daily metrics, and the salesperson
//! dimension.
//!
//! The database is the working store for collected aggregates; tokens are
//! append-only, daily metrics are write-once per (date, open_user_id), and
//! sales people are upserted. WAL mode keeps concurrent readers cheap while
//! collection workers write through a shared connection.

use std::path::Path;

use rusqlite::Connection;

pub mod types;
pub use types::*;

mod metrics;
mod sales;
mod tokens;

pub struct MetricsDb {
    conn: Connection,
}

impl MetricsDb {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn })
    }
}

#[cfg(test)]
pub(crate) fn open_test_db(dir: &tempfile::TempDir) -> MetricsDb {
    let path = dir.path().join("test.db");
    MetricsDb::open(&path).expect("failed to open test database")
}
