use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{DbAccessToken, DbError, MetricsDb};

impl MetricsDb {
    // =========================================================================
    // Access tokens (append-only)
    // =========================================================================

    /// Append a new token row. Old rows are superseded, never deleted.
    pub fn insert_access_token(
        &self,
        token_type: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO api_tokens (token_type, access_token, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                token_type,
                access_token,
                expires_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The most recently created token of the given type that is still valid
    /// at `now`, if any.
    pub fn latest_valid_token(
        &self,
        token_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DbAccessToken>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, token_type, access_token, expires_at, created_at
             FROM api_tokens
             WHERE token_type = ?1 AND expires_at > ?2
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![token_type, now.to_rfc3339()], |row| {
            Ok(DbAccessToken {
                id: row.get(0)?,
                token_type: row.get(1)?,
                access_token: row.get(2)?,
                expires_at: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Total token rows of the given type. Diagnostics only.
    pub fn count_tokens(&self, token_type: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM api_tokens WHERE token_type = ?1",
            params![token_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
