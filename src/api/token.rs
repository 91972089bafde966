//! Access-token lifecycle.
//!
//! Token lookup is three-tiered: an in-memory cache answers almost every
//! call, the append-only `api_tokens` table survives restarts, and the remote
//! auth endpoint is only hit when neither has a valid token. A background
//! loop refreshes ahead of expiry so workers rarely pay the refresh latency.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::db::MetricsDb;

use super::{parse_envelope, ApiError, REQUEST_TIMEOUT_SECS};

pub const APP_ACCESS_TOKEN_TYPE: &str = "app_access_token";

/// Refresh this many seconds before the token expires.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
/// Wait this long before retrying a failed scheduled refresh.
pub const TOKEN_RETRY_DELAY_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    app_access_token: String,
    /// Lifetime in seconds from now.
    expire: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenManager {
    http: reqwest::Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    db: Arc<Mutex<MetricsDb>>,
    cached: Mutex<Option<CachedToken>>,
    /// Serializes refreshes so concurrent workers trigger one network call.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(
        base_url: &str,
        app_key: &str,
        app_secret: &str,
        db: Arc<Mutex<MetricsDb>>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            db,
            cached: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Ensure a usable token exists before any collection starts.
    pub async fn initialize(&self) -> Result<(), ApiError> {
        self.get_access_token().await?;
        log::info!("token manager initialized");
        Ok(())
    }

    /// Return a token valid right now: memory cache first, then the newest
    /// persisted row, then a network refresh.
    pub async fn get_access_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.cached_if_valid() {
            return Ok(token);
        }

        if let Some(token) = self.load_from_db()? {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.cached_if_valid() {
            return Ok(token);
        }
        self.refresh_locked().await
    }

    /// Force a refresh regardless of cache state.
    pub async fn refresh_access_token(&self) -> Result<String, ApiError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh ahead of expiry forever. Spawn once at startup.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        loop {
            let delay_secs = {
                let cached = self.cached.lock();
                match cached.as_ref() {
                    Some(token) => ((token.expires_at - Utc::now()).num_seconds()
                        - TOKEN_REFRESH_MARGIN_SECS)
                        .max(0) as u64,
                    None => 0,
                }
            };
            log::info!("next token refresh in {}s", delay_secs);
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;

            if let Err(err) = self.refresh_access_token().await {
                log::error!("scheduled token refresh failed: {}", err);
                tokio::time::sleep(Duration::from_secs(TOKEN_RETRY_DELAY_SECS)).await;
            }
        }
    }

    fn cached_if_valid(&self) -> Option<String> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|token| token.expires_at > Utc::now())
            .map(|token| token.access_token.clone())
    }

    fn load_from_db(&self) -> Result<Option<String>, ApiError> {
        let row = self
            .db
            .lock()
            .latest_valid_token(APP_ACCESS_TOKEN_TYPE, Utc::now())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Ok(expires_at) = DateTime::parse_from_rfc3339(&row.expires_at) else {
            log::warn!("stored token row {} has unparseable expiry, ignoring", row.id);
            return Ok(None);
        };

        log::info!("loaded access token from database into memory");
        let mut cached = self.cached.lock();
        *cached = Some(CachedToken {
            access_token: row.access_token.clone(),
            expires_at: expires_at.with_timezone(&Utc),
        });
        Ok(Some(row.access_token))
    }

    async fn refresh_locked(&self) -> Result<String, ApiError> {
        let url = format!("{}/openapi/auth/v1/app_access_token/internal", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "app_key": self.app_key,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .map_err(|e| ApiError::RefreshFailed(e.to_string()))?;

        let data: TokenResponse = parse_envelope(response)
            .await
            .map_err(|e| ApiError::RefreshFailed(e.to_string()))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(data.expire);
        self.db.lock().insert_access_token(
            APP_ACCESS_TOKEN_TYPE,
            &data.app_access_token,
            expires_at,
        )?;

        let mut cached = self.cached.lock();
        *cached = Some(CachedToken {
            access_token: data.app_access_token.clone(),
            expires_at,
        });
        log::info!("access token refreshed, expires at {}", expires_at.to_rfc3339());

        Ok(data.app_access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn manager(dir: &tempfile::TempDir, base_url: &str) -> (TokenManager, Arc<Mutex<MetricsDb>>) {
        let db = Arc::new(Mutex::new(crate::db::open_test_db(dir)));
        let manager =
            TokenManager::new(base_url, "key", "secret", db.clone()).expect("token manager");
        (manager, db)
    }

    #[tokio::test]
    async fn test_persisted_token_is_served_without_network() {
        let dir = tempfile::tempdir().expect("temp dir");
        // Unroutable base URL: any network attempt would fail loudly.
        let (manager, db) = manager(&dir, "http://127.0.0.1:1");

        db.lock()
            .insert_access_token(
                APP_ACCESS_TOKEN_TYPE,
                "persisted",
                Utc::now() + ChronoDuration::hours(1),
            )
            .unwrap();

        let token = manager.get_access_token().await.expect("token");
        assert_eq!(token, "persisted");

        // Second call hits the memory cache.
        let token = manager.get_access_token().await.expect("cached token");
        assert_eq!(token, "persisted");
    }

    #[tokio::test]
    async fn test_expired_persisted_token_forces_refresh() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (manager, db) = manager(&dir, "http://127.0.0.1:1");

        db.lock()
            .insert_access_token(
                APP_ACCESS_TOKEN_TYPE,
                "expired",
                Utc::now() - ChronoDuration::minutes(1),
            )
            .unwrap();

        // The only remaining source is the network, which is unreachable here.
        let result = manager.get_access_token().await;
        assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
    }
}
