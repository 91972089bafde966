//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A row from the append-only `api_tokens` table. The current token is the
/// most recently created non-expired row; superseded rows are never deleted.
#[derive(Debug, Clone)]
pub struct DbAccessToken {
    pub id: i64,
    pub token_type: String,
    pub access_token: String,
    /// RFC 3339 UTC expiry.
    pub expires_at: String,
    pub created_at: String,
}

/// A row from the `daily_metrics` table. Keyed by (date, open_user_id) and
/// write-once: existence of a row is the idempotency guard for a collection
/// unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDailyMetric {
    /// Analysis date, `YYYY-MM-DD`.
    pub date: String,
    pub open_user_id: String,
    pub customer_turn_count: i64,
    pub timely_reply_count: i64,
    pub overtime_reply_count: i64,
    pub total_reply_duration: i64,
    pub new_rule_customer_turn_count: i64,
    pub overtime_no_reply_count: i64,
    /// Conversations whose transcript was successfully retrieved and analyzed.
    pub processed_conversation_ids: Vec<String>,
    pub created_at: String,
}

/// A row from the `sales_people` dimension table, keyed by open_user_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSalesPerson {
    pub open_user_id: String,
    pub name: String,
    pub main_department_id: i64,
    pub is_delete: bool,
    /// "normal" or "not found".
    pub status: String,
    pub department_name: String,
    pub parent_department_id: i64,
    pub lead_open_user_id: String,
    /// JSON array of sync diagnostics, if any sync ever logged one.
    pub log_info: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) fn map_sales_person_row(row: &rusqlite::Row) -> rusqlite::Result<DbSalesPerson> {
    Ok(DbSalesPerson {
        open_user_id: row.get(0)?,
        name: row.get(1)?,
        main_department_id: row.get(2)?,
        is_delete: row.get::<_, i64>(3)? != 0,
        status: row.get(4)?,
        department_name: row.get(5)?,
        parent_department_id: row.get(6)?,
        lead_open_user_id: row.get(7)?,
        log_info: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
