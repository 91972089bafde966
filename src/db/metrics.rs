use chrono::Utc;
use rusqlite::params;

use super::{DbDailyMetric, DbError, MetricsDb};

impl MetricsDb {
    // =========================================================================
    // Daily metrics (write-once per (date, open_user_id))
    // =========================================================================

    /// Whether a metric row already exists for this (date, open_user_id).
    /// This is the idempotency pre-check for a collection unit.
    pub fn daily_metric_exists(&self, date: &str, open_user_id: &str) -> Result<bool, DbError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM daily_metrics WHERE date = ?1 AND open_user_id = ?2)",
            params![date, open_user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Insert a metric row. Returns false if a row for the key already exists;
    /// existing rows are never updated.
    pub fn insert_daily_metric(&self, metric: &DbDailyMetric) -> Result<bool, DbError> {
        let processed = serde_json::to_string(&metric.processed_conversation_ids)?;
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO daily_metrics (
                date, open_user_id, customer_turn_count, timely_reply_count,
                overtime_reply_count, total_reply_duration,
                new_rule_customer_turn_count, overtime_no_reply_count,
                processed_conversation_ids, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                metric.date,
                metric.open_user_id,
                metric.customer_turn_count,
                metric.timely_reply_count,
                metric.overtime_reply_count,
                metric.total_reply_duration,
                metric.new_rule_customer_turn_count,
                metric.overtime_no_reply_count,
                processed,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Fetch one metric row, if present.
    pub fn get_daily_metric(
        &self,
        date: &str,
        open_user_id: &str,
    ) -> Result<Option<DbDailyMetric>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT date, open_user_id, customer_turn_count, timely_reply_count,
                    overtime_reply_count, total_reply_duration,
                    new_rule_customer_turn_count, overtime_no_reply_count,
                    processed_conversation_ids, created_at
             FROM daily_metrics WHERE date = ?1 AND open_user_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![date, open_user_id], |row| {
            Ok((
                DbDailyMetric {
                    date: row.get(0)?,
                    open_user_id: row.get(1)?,
                    customer_turn_count: row.get(2)?,
                    timely_reply_count: row.get(3)?,
                    overtime_reply_count: row.get(4)?,
                    total_reply_duration: row.get(5)?,
                    new_rule_customer_turn_count: row.get(6)?,
                    overtime_no_reply_count: row.get(7)?,
                    processed_conversation_ids: Vec::new(),
                    created_at: row.get(9)?,
                },
                row.get::<_, String>(8)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (mut metric, processed_json) = row?;
                metric.processed_conversation_ids =
                    serde_json::from_str(&processed_json).unwrap_or_default();
                Ok(Some(metric))
            }
            None => Ok(None),
        }
    }

    /// Number of metric rows for one analysis date.
    pub fn count_daily_metrics(&self, date: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM daily_metrics WHERE date = ?1",
            params![date],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
