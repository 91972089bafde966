//! Service entry point.
//!
//! `salespulse run` starts the long-running service: token refresh loop plus
//! the cron scheduler for the nightly collection. The `collect*` subcommands
//! perform one-shot collections for operators backfilling or re-running days.

use std::process::exit;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;

use salespulse::api::source::ConversationSource;
use salespulse::api::token::TokenManager;
use salespulse::api::ApiClient;
use salespulse::collector::Collector;
use salespulse::config::Config;
use salespulse::db::MetricsDb;
use salespulse::scheduler::Scheduler;

const USAGE: &str = "usage: salespulse [run | collect | collect-date <YYYY-MM-DD> | collect-range <YYYY-MM-DD> <YYYY-MM-DD>]";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        log::error!("fatal: {}", err);
        exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");

    let config = Config::from_env()?;
    let db = Arc::new(Mutex::new(MetricsDb::open(&config.database_path)?));

    let tokens = Arc::new(TokenManager::new(
        &config.api_base_url,
        &config.app_key,
        &config.app_secret,
        db.clone(),
    )?);
    tokens.initialize().await?;

    let source: Arc<dyn ConversationSource> =
        Arc::new(ApiClient::new(&config.api_base_url, tokens.clone())?);
    let collector = Arc::new(Collector::new(source, db, &config)?);

    match command {
        "run" => {
            tokio::spawn(tokens.clone().run_refresh_loop());
            let scheduler = Scheduler::new(collector, &config.cron_schedule, config.timezone)?;
            scheduler.run().await;
            Ok(())
        }
        "collect" => {
            let report = collector.collect_daily().await?;
            log::info!(
                "collected {}: {}/{} salespeople ({} failed)",
                report.date,
                report.succeeded,
                report.sales_total,
                report.failed
            );
            Ok(())
        }
        "collect-date" => {
            let date = parse_date_arg(&args, 1)?;
            let report = collector.collect_for_date(date).await?;
            log::info!(
                "collected {}: {}/{} salespeople ({} failed)",
                report.date,
                report.succeeded,
                report.sales_total,
                report.failed
            );
            Ok(())
        }
        "collect-range" => {
            let start = parse_date_arg(&args, 1)?;
            let end = parse_date_arg(&args, 2)?;
            let summary = collector.collect_for_range(start, end).await?;
            log::info!(
                "range collected: {} days, {} succeeded, {} failed",
                summary.total,
                summary.success,
                summary.failed
            );
            if !summary.failed_dates.is_empty() {
                let dates: Vec<String> =
                    summary.failed_dates.iter().map(|d| d.to_string()).collect();
                log::warn!("failed dates: {}", dates.join(", "));
                exit(1);
            }
            Ok(())
        }
        other => Err(format!("unknown command '{}'\n{}", other, USAGE).into()),
    }
}

fn parse_date_arg(args: &[String], index: usize) -> Result<NaiveDate, Box<dyn std::error::Error>> {
    let raw = args
        .get(index)
        .ok_or_else(|| format!("missing date argument\n{}", USAGE))?;
    let date = raw
        .parse::<NaiveDate>()
        .map_err(|_| format!("invalid date '{}', expected YYYY-MM-DD", raw))?;
    Ok(date)
}
