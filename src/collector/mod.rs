//! Daily collection orchestration.
//!
//! One collection run covers a window from 02:00 local on the analysis date
//! to 02:00 the next day. Conversations in the window are grouped per
//! salesperson and processed with bounded concurrency at two levels:
//! salespeople in parallel, and each salesperson's transcript fetches in
//! parallel. Results land in `daily_metrics`, write-once per
//! (date, salesperson), which makes whole runs safe to repeat.

pub mod diagnostics;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use thiserror::Error;

use crate::analyzer::{analyze_conversation, ConversationMetrics, TranscriptItem};
use crate::api::conversations::{Conversation, TranscriptFetch};
use crate::api::source::ConversationSource;
use crate::api::ApiError;
use crate::concurrency::{batch_process, TaskOutcome};
use crate::config::Config;
use crate::db::{DbDailyMetric, DbError, MetricsDb};
use crate::sales_sync::{RunCaches, SalesSyncService};

use diagnostics::{DiagEntry, DiagnosticsLog};

/// Local hour at which one analysis day hands over to the next.
pub const WINDOW_BOUNDARY_HOUR: u32 = 2;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("API: {0}")]
    Api(#[from] ApiError),

    #[error("Database: {0}")]
    Db(#[from] DbError),

    #[error("Diagnostics log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid date range: {0}")]
    InvalidRange(String),
}

/// One collection window. The remote list endpoint takes local wall-clock
/// strings, so both bounds are pre-formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionWindow {
    /// Analysis date the collected metrics are attributed to.
    pub date: NaiveDate,
    pub begin_param: String,
    pub end_param: String,
}

/// Window for one analysis date: [date 02:00, date+1 02:00) local time.
pub fn window_for_date(date: NaiveDate) -> CollectionWindow {
    CollectionWindow {
        date,
        begin_param: format!(
            "{} {:02}:00:00",
            date.format("%Y-%m-%d"),
            WINDOW_BOUNDARY_HOUR
        ),
        end_param: format!(
            "{} {:02}:00:00",
            (date + Duration::days(1)).format("%Y-%m-%d"),
            WINDOW_BOUNDARY_HOUR
        ),
    }
}

/// Window for the nightly run: yesterday's date in the local timezone.
pub fn daily_window(tz: Tz) -> CollectionWindow {
    let today = Utc::now().with_timezone(&tz).date_naive();
    window_for_date(today - Duration::days(1))
}

/// Group conversations by salesperson, preserving first-seen order.
pub(crate) fn group_by_sales(
    conversations: Vec<Conversation>,
) -> Vec<(String, Vec<Conversation>)> {
    let mut order: Vec<String> = Vec::new();
    let mut map: HashMap<String, Vec<Conversation>> = HashMap::new();
    for conversation in conversations {
        if !map.contains_key(&conversation.open_user_id) {
            order.push(conversation.open_user_id.clone());
        }
        map.entry(conversation.open_user_id.clone())
            .or_default()
            .push(conversation);
    }
    order
        .into_iter()
        .map(|key| {
            let group = map.remove(&key).unwrap_or_default();
            (key, group)
        })
        .collect()
}

/// Outcome of one day's collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayReport {
    pub date: NaiveDate,
    pub sales_total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Outcome of a multi-day backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub failed_dates: Vec<NaiveDate>,
}

#[derive(Clone)]
pub struct Collector {
    source: Arc<dyn ConversationSource>,
    db: Arc<Mutex<MetricsDb>>,
    sync: Arc<SalesSyncService>,
    diagnostics: Arc<DiagnosticsLog>,
    timezone: Tz,
    outer_concurrency: usize,
    inner_concurrency: usize,
}

impl Collector {
    pub fn new(
        source: Arc<dyn ConversationSource>,
        db: Arc<Mutex<MetricsDb>>,
        config: &Config,
    ) -> Result<Self, CollectError> {
        let sync = Arc::new(SalesSyncService::new(source.clone(), db.clone()));
        // One diagnostics file per process start.
        let diagnostics = Arc::new(DiagnosticsLog::new(&config.log_dir)?);
        Ok(Self {
            source,
            db,
            sync,
            diagnostics,
            timezone: config.timezone,
            outer_concurrency: config.outer_concurrency,
            inner_concurrency: config.inner_concurrency,
        })
    }

    /// Nightly run: collect yesterday's window.
    pub async fn collect_daily(&self) -> Result<DayReport, CollectError> {
        self.collect_window(&daily_window(self.timezone)).await
    }

    /// Collect one specific date. Safe to repeat.
    pub async fn collect_for_date(&self, date: NaiveDate) -> Result<DayReport, CollectError> {
        self.collect_window(&window_for_date(date)).await
    }

    /// Collect every date in `[start, end]`, one day at a time. A day's
    /// failure is recorded and the remaining days still run.
    pub async fn collect_for_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RangeSummary, CollectError> {
        if start > end {
            return Err(CollectError::InvalidRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        let total = (end - start).num_days() as usize + 1;
        log::info!("backfill {} ~ {}: {} days", start, end, total);

        let mut success = 0;
        let mut failed = 0;
        let mut failed_dates = Vec::new();

        let mut current = start;
        let mut day_index = 1;
        while current <= end {
            log::info!("[{}/{}] collecting {}", day_index, total, current);
            match self.collect_for_date(current).await {
                Ok(report) => {
                    success += 1;
                    log::info!(
                        "{} collected: {}/{} salespeople",
                        current,
                        report.succeeded,
                        report.sales_total
                    );
                }
                Err(err) => {
                    failed += 1;
                    failed_dates.push(current);
                    log::error!("{} collection failed: {}", current, err);
                }
            }
            current += Duration::days(1);
            day_index += 1;
        }

        log::info!(
            "backfill finished: {} total, {} succeeded, {} failed",
            total,
            success,
            failed
        );
        if !failed_dates.is_empty() {
            let dates: Vec<String> = failed_dates.iter().map(|d| d.to_string()).collect();
            log::warn!("failed dates: {}", dates.join(", "));
        }

        Ok(RangeSummary {
            total,
            success,
            failed,
            failed_dates,
        })
    }

    async fn collect_window(&self, window: &CollectionWindow) -> Result<DayReport, CollectError> {
        log::info!(
            "collection window {} ~ {} (analysis date {})",
            window.begin_param,
            window.end_param,
            window.date
        );
        let started = std::time::Instant::now();

        let conversations = self
            .source
            .fetch_conversations(&window.begin_param, &window.end_param)
            .await?;

        if conversations.is_empty() {
            log::info!("nothing to collect for {}", window.date);
            return Ok(DayReport {
                date: window.date,
                sales_total: 0,
                succeeded: 0,
                failed: 0,
            });
        }

        let groups = group_by_sales(conversations);
        let sales_total = groups.len();
        log::info!("{} salespeople to process", sales_total);

        // Fresh per window so org data cannot go stale across days.
        let caches = Arc::new(Mutex::new(RunCaches::new()));

        let this = self.clone();
        let date = window.date;
        let summary = batch_process(
            groups,
            self.outer_concurrency,
            None,
            move |(open_user_id, group): (String, Vec<Conversation>)| {
                let this = this.clone();
                let caches = Arc::clone(&caches);
                async move {
                    let result = this
                        .process_sales_day(date, &open_user_id, group, &caches)
                        .await;
                    if let Err(err) = &result {
                        log::error!("processing salesperson {} failed: {}", open_user_id, err);
                    }
                    result
                }
            },
        )
        .await;

        log::info!(
            "collection for {} finished: {}/{} salespeople ({} failed) in {:.2}s",
            window.date,
            summary.success,
            sales_total,
            summary.failed,
            started.elapsed().as_secs_f64()
        );

        Ok(DayReport {
            date: window.date,
            sales_total,
            succeeded: summary.success,
            failed: summary.failed,
        })
    }

    /// Process one salesperson's conversations for one analysis date.
    async fn process_sales_day(
        &self,
        date: NaiveDate,
        open_user_id: &str,
        conversations: Vec<Conversation>,
        caches: &Mutex<RunCaches>,
    ) -> Result<(), CollectError> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let total = conversations.len();
        log::info!(
            "processing salesperson {}: {} conversations",
            open_user_id,
            total
        );

        if self.db.lock().daily_metric_exists(&date_str, open_user_id)? {
            log::info!(
                "metrics for {} on {} already present, skipping",
                open_user_id,
                date_str
            );
            return Ok(());
        }

        self.sync.sync_from_conversation(open_user_id, caches).await?;

        let source = self.source.clone();
        let summary = batch_process(
            conversations,
            self.inner_concurrency,
            None,
            move |conversation: Conversation| {
                let source = source.clone();
                async move {
                    let fetch = source
                        .fetch_transcript(&conversation.origin_conversation_id)
                        .await;
                    Ok::<_, Infallible>((conversation.origin_conversation_id, fetch))
                }
            },
        )
        .await;

        let mut transcripts: Vec<Vec<TranscriptItem>> = Vec::new();
        let mut processed_ids: Vec<String> = Vec::new();
        let mut failures: Vec<DiagEntry> = Vec::new();

        for outcome in summary.outcomes {
            match outcome {
                TaskOutcome::Success((id, TranscriptFetch::Ready(items))) if !items.is_empty() => {
                    transcripts.push(items);
                    processed_ids.push(id);
                }
                TaskOutcome::Success((id, TranscriptFetch::Ready(_))) => {
                    failures.push(self.diag_entry(
                        id,
                        open_user_id,
                        "transcript empty",
                        "remote file decoded to an empty transcript",
                    ));
                }
                TaskOutcome::Success((id, TranscriptFetch::NotReady)) => {
                    failures.push(self.diag_entry(
                        id,
                        open_user_id,
                        "transcription not finished",
                        "remote transcription still in progress",
                    ));
                }
                TaskOutcome::Success((id, TranscriptFetch::Failed { reason, detail })) => {
                    failures.push(DiagEntry {
                        conversation_id: id,
                        open_user_id: open_user_id.to_string(),
                        reason,
                        detail,
                    });
                }
                TaskOutcome::Failure(detail) => {
                    failures.push(self.diag_entry(
                        "unknown".to_string(),
                        open_user_id,
                        "transcript task failed",
                        &detail,
                    ));
                }
            }
        }

        if !failures.is_empty() {
            log::warn!(
                "{} transcripts unavailable for {} (see {})",
                failures.len(),
                open_user_id,
                self.diagnostics.path().display()
            );
            self.diagnostics
                .append_batch(open_user_id, total, transcripts.len(), &failures)?;
        }
        log::info!(
            "retrieved {}/{} transcripts for {}",
            transcripts.len(),
            total,
            open_user_id
        );

        let mut totals = ConversationMetrics::default();
        for items in &transcripts {
            totals.absorb(&analyze_conversation(items, date, self.timezone));
        }

        let metric = DbDailyMetric {
            date: date_str.clone(),
            open_user_id: open_user_id.to_string(),
            customer_turn_count: totals.customer_turn_count,
            timely_reply_count: totals.timely_reply_count,
            overtime_reply_count: totals.overtime_reply_count,
            total_reply_duration: totals.total_reply_duration,
            new_rule_customer_turn_count: totals.new_rule_customer_turn_count,
            overtime_no_reply_count: totals.overtime_no_reply_count,
            processed_conversation_ids: processed_ids,
            created_at: String::new(),
        };

        if self.db.lock().insert_daily_metric(&metric)? {
            log::info!(
                "saved metrics for {} on {}: {} customer turns, {} timely, {} overtime",
                open_user_id,
                date_str,
                metric.customer_turn_count,
                metric.timely_reply_count,
                metric.overtime_reply_count
            );
        } else {
            // Another worker or run won the race; existing data stands.
            log::info!(
                "metrics for {} on {} inserted concurrently, keeping existing row",
                open_user_id,
                date_str
            );
        }

        Ok(())
    }

    fn diag_entry(
        &self,
        conversation_id: String,
        open_user_id: &str,
        reason: &str,
        detail: &str,
    ) -> DiagEntry {
        DiagEntry {
            conversation_id,
            open_user_id: open_user_id.to_string(),
            reason: reason.to_string(),
            detail: detail.to_string(),
        }
    }
}
