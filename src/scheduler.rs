//! Cron-driven nightly collection.
//!
//! The schedule is a 5-field cron expression evaluated in the configured
//! timezone. The loop polls once a minute; a trigger fires when the current
//! minute is within two minutes of a scheduled time that has not already run,
//! which tolerates clock drift around the poll boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

use crate::collector::Collector;

const POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },
}

/// Parse a 5-field cron expression.
///
/// The cron crate expects 6 fields (with seconds); prepend "0" so operators
/// can use the conventional 5-field form.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let full_expr = format!("0 {}", expr);
    full_expr
        .parse::<Schedule>()
        .map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })
}

/// Whether the schedule is due at `now`, given the last triggered run.
pub fn should_run_now(
    schedule: &Schedule,
    tz: Tz,
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> bool {
    let now_local = now.with_timezone(&tz);

    // Find the most recent scheduled time near now.
    let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));

    if let Some(next_time) = scheduled_times.next() {
        let next_utc = next_time.with_timezone(&Utc);
        let diff = (now - next_utc).num_seconds().abs();

        if diff < 120 {
            if let Some(last) = last_run {
                if (last - next_utc).num_seconds().abs() < 60 {
                    return false; // Already ran this slot
                }
            }
            return true;
        }
    }

    false
}

pub struct Scheduler {
    collector: Arc<Collector>,
    schedule: Schedule,
    cron_expr: String,
    timezone: Tz,
}

impl Scheduler {
    pub fn new(
        collector: Arc<Collector>,
        cron_expr: &str,
        timezone: Tz,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            collector,
            schedule: parse_cron(cron_expr)?,
            cron_expr: cron_expr.to_string(),
            timezone,
        })
    }

    /// Run forever, triggering the nightly collection when due.
    pub async fn run(&self) {
        log::info!(
            "scheduler started: '{}' in {}",
            self.cron_expr,
            self.timezone
        );
        let mut last_run: Option<DateTime<Utc>> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let now = Utc::now();
            if !should_run_now(&self.schedule, self.timezone, now, last_run) {
                continue;
            }
            last_run = Some(now);

            log::info!("scheduled collection triggered");
            match self.collector.collect_daily().await {
                Ok(report) => log::info!(
                    "scheduled collection finished: {}/{} salespeople ({} failed)",
                    report.succeeded,
                    report.sales_total,
                    report.failed
                ),
                Err(err) => log::error!("scheduled collection failed: {}", err),
            }
        }
    }
}
