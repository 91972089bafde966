//! Runtime configuration loaded from environment variables.
//!
//! The service is configured entirely through the environment; `from_env`
//! is called once at startup and a missing required key aborts the process
//! before any remote call or database open happens.

use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

/// Default remote API base URL.
const DEFAULT_BASE_URL: &str = "https://open.megaview.com";
/// Default daily collection trigger: 05:00 in the configured timezone.
const DEFAULT_CRON_SCHEDULE: &str = "0 5 * * *";
const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
const DEFAULT_DATABASE_PATH: &str = "salespulse.db";
const DEFAULT_LOG_DIR: &str = "logs";

/// Max salespeople processed in flight for one window.
pub const DEFAULT_OUTER_CONCURRENCY: usize = 50;
/// Max transcript fetches in flight per salesperson.
pub const DEFAULT_INNER_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {0}")]
    MissingKeys(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub cron_schedule: String,
    pub timezone: Tz,
    pub outer_concurrency: usize,
    pub inner_concurrency: usize,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Split out from `from_env`
    /// so tests can drive it without mutating process-global state.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = ["SWAPI_APP_KEY", "SWAPI_APP_SECRET"];
        let missing: Vec<&str> = required
            .iter()
            .filter(|key| lookup(key).map(|v| v.trim().is_empty()).unwrap_or(true))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing.join(", ")));
        }

        let tz_name = lookup("TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone: Tz = tz_name
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(tz_name))?;

        Ok(Self {
            api_base_url: lookup("SWAPI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            app_key: lookup("SWAPI_APP_KEY").unwrap_or_default(),
            app_secret: lookup("SWAPI_APP_SECRET").unwrap_or_default(),
            database_path: PathBuf::from(
                lookup("DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            ),
            log_dir: PathBuf::from(lookup("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
            cron_schedule: lookup("CRON_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_CRON_SCHEDULE.to_string()),
            timezone,
            outer_concurrency: parse_usize(&lookup, "OUTER_CONCURRENCY", DEFAULT_OUTER_CONCURRENCY)?,
            inner_concurrency: parse_usize(&lookup, "INNER_CONCURRENCY", DEFAULT_INNER_CONCURRENCY)?,
        })
    }
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config =
            Config::from_lookup(env(&[("SWAPI_APP_KEY", "k"), ("SWAPI_APP_SECRET", "s")])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.cron_schedule, DEFAULT_CRON_SCHEDULE);
        assert_eq!(config.timezone, chrono_tz::Asia::Shanghai);
        assert_eq!(config.outer_concurrency, 50);
        assert_eq!(config.inner_concurrency, 10);
    }

    #[test]
    fn test_missing_required_keys() {
        let err = Config::from_lookup(env(&[("SWAPI_APP_KEY", "k")])).unwrap_err();
        match err {
            ConfigError::MissingKeys(keys) => assert_eq!(keys, "SWAPI_APP_SECRET"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blank_required_key_counts_as_missing() {
        let err = Config::from_lookup(env(&[
            ("SWAPI_APP_KEY", "  "),
            ("SWAPI_APP_SECRET", "s"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKeys(_)));
    }

    #[test]
    fn test_invalid_timezone() {
        let err = Config::from_lookup(env(&[
            ("SWAPI_APP_KEY", "k"),
            ("SWAPI_APP_SECRET", "s"),
            ("TIMEZONE", "Mars/Olympus"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimezone(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let config = Config::from_lookup(env(&[
            ("SWAPI_APP_KEY", "k"),
            ("SWAPI_APP_SECRET", "s"),
            ("SWAPI_BASE_URL", "https://api.example.com/"),
        ]))
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
    }

    #[test]
    fn test_concurrency_override() {
        let config = Config::from_lookup(env(&[
            ("SWAPI_APP_KEY", "k"),
            ("SWAPI_APP_SECRET", "s"),
            ("OUTER_CONCURRENCY", "8"),
            ("INNER_CONCURRENCY", "2"),
        ]))
        .unwrap();
        assert_eq!(config.outer_concurrency, 8);
        assert_eq!(config.inner_concurrency, 2);
    }
}
