//! Salesperson dimension sync.
//!
//! Each collection run syncs every salesperson it encounters exactly once,
//! backed by two per-run caches: the set of already-synced people and a
//! department lookup cache. Missing users and department problems are
//! recorded on the row (`log_info`) instead of failing the run; only
//! transport errors on the user lookup propagate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::api::source::ConversationSource;
use crate::api::{ApiError, CODE_DEPARTMENT_NOT_FOUND, CODE_USER_NOT_FOUND};
use crate::db::{DbSalesPerson, MetricsDb};

const DEFAULT_FIELD: &str = "unknown";
const STATUS_NORMAL: &str = "normal";
const STATUS_NOT_FOUND: &str = "not found";

#[derive(Debug, Clone)]
pub struct DepartmentCacheEntry {
    pub name: String,
    pub parent_id: i64,
    pub lead_id: String,
}

/// Per-run caches. Fresh for every collection window so stale org data does
/// not leak across days.
#[derive(Default)]
pub struct RunCaches {
    synced: HashSet<String>,
    departments: HashMap<i64, DepartmentCacheEntry>,
}

impl RunCaches {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize)]
struct SyncLogEntry {
    time: String,
    error: String,
    code: i64,
}

pub struct SalesSyncService {
    source: Arc<dyn ConversationSource>,
    db: Arc<Mutex<MetricsDb>>,
}

impl SalesSyncService {
    pub fn new(source: Arc<dyn ConversationSource>, db: Arc<Mutex<MetricsDb>>) -> Self {
        Self { source, db }
    }

    /// Sync one salesperson seen in a conversation, at most once per run.
    pub async fn sync_from_conversation(
        &self,
        open_user_id: &str,
        caches: &Mutex<RunCaches>,
    ) -> Result<(), ApiError> {
        if caches.lock().synced.contains(open_user_id) {
            return Ok(());
        }

        log::info!("syncing salesperson {}", open_user_id);

        let timestamp = chrono::Utc::now().to_rfc3339();
        let mut sync_logs: Vec<SyncLogEntry> = Vec::new();

        // Transport errors here abort the sync; a missing user does not.
        let user = self.source.fetch_user(open_user_id).await?;

        let mut name = DEFAULT_FIELD.to_string();
        let mut main_department_id = 0i64;
        let mut is_delete = false;
        let mut status = STATUS_NORMAL.to_string();

        match &user {
            Some(user) => {
                if let Some(user_name) = &user.name {
                    name = user_name.clone();
                }
                main_department_id = user.main_department_id.unwrap_or(0);
                is_delete = user.status.as_ref().map(|s| s.is_delete).unwrap_or(false);
            }
            None => {
                status = STATUS_NOT_FOUND.to_string();
                sync_logs.push(SyncLogEntry {
                    time: timestamp.clone(),
                    error: format!("user {} not found", open_user_id),
                    code: CODE_USER_NOT_FOUND,
                });
            }
        }

        let mut department_name = DEFAULT_FIELD.to_string();
        let mut parent_department_id = 0i64;
        let mut lead_open_user_id = DEFAULT_FIELD.to_string();

        if main_department_id > 0 {
            let cached = caches.lock().departments.get(&main_department_id).cloned();
            match cached {
                Some(entry) => {
                    department_name = entry.name;
                    parent_department_id = entry.parent_id;
                    lead_open_user_id = entry.lead_id;
                }
                None => match self.source.fetch_department(main_department_id).await {
                    Ok(Some(department)) => {
                        department_name = department
                            .name
                            .unwrap_or_else(|| DEFAULT_FIELD.to_string());
                        parent_department_id = department.parent_department_id.unwrap_or(0);
                        lead_open_user_id = department
                            .lead_open_user_id
                            .unwrap_or_else(|| DEFAULT_FIELD.to_string());
                        caches.lock().departments.insert(
                            main_department_id,
                            DepartmentCacheEntry {
                                name: department_name.clone(),
                                parent_id: parent_department_id,
                                lead_id: lead_open_user_id.clone(),
                            },
                        );
                    }
                    Ok(None) => {
                        sync_logs.push(SyncLogEntry {
                            time: timestamp.clone(),
                            error: format!("department {} not found", main_department_id),
                            code: CODE_DEPARTMENT_NOT_FOUND,
                        });
                    }
                    // Department lookup failures degrade the row, never the run.
                    Err(err) => {
                        sync_logs.push(SyncLogEntry {
                            time: timestamp.clone(),
                            error: format!(
                                "department {} lookup failed: {}",
                                main_department_id, err
                            ),
                            code: err.business_code().unwrap_or(500),
                        });
                    }
                },
            }
        }

        let log_info = if sync_logs.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&sync_logs).map_err(crate::db::DbError::Json)?)
        };

        let person = DbSalesPerson {
            open_user_id: open_user_id.to_string(),
            name,
            main_department_id,
            is_delete,
            status,
            department_name,
            parent_department_id,
            lead_open_user_id,
            log_info,
            created_at: String::new(),
            updated_at: String::new(),
        };

        let created = self.db.lock().upsert_sales_person(&person)?;
        if created {
            log::info!("created salesperson {} ({})", open_user_id, person.name);
        } else {
            log::debug!("updated salesperson {}", open_user_id);
        }

        caches.lock().synced.insert(open_user_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::conversations::{Conversation, TranscriptFetch};
    use crate::api::org::{RemoteDepartment, RemoteUser, RemoteUserStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockOrg {
        users: HashMap<String, RemoteUser>,
        departments: HashMap<i64, RemoteDepartment>,
        department_should_fail: bool,
        user_calls: AtomicUsize,
        department_calls: AtomicUsize,
    }

    impl MockOrg {
        fn new() -> Self {
            Self {
                users: HashMap::new(),
                departments: HashMap::new(),
                department_should_fail: false,
                user_calls: AtomicUsize::new(0),
                department_calls: AtomicUsize::new(0),
            }
        }

        fn with_user(mut self, open_user_id: &str, name: &str, department_id: i64) -> Self {
            self.users.insert(
                open_user_id.to_string(),
                RemoteUser {
                    name: Some(name.to_string()),
                    main_department_id: Some(department_id),
                    status: Some(RemoteUserStatus { is_delete: false }),
                },
            );
            self
        }

        fn with_department(mut self, id: i64, name: &str) -> Self {
            self.departments.insert(
                id,
                RemoteDepartment {
                    name: Some(name.to_string()),
                    parent_department_id: Some(1),
                    lead_open_user_id: Some("lead-1".to_string()),
                },
            );
            self
        }
    }

    #[async_trait]
    impl ConversationSource for MockOrg {
        async fn fetch_conversations(
            &self,
            _begin_time: &str,
            _end_time: &str,
        ) -> Result<Vec<Conversation>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_transcript(&self, _origin_conversation_id: &str) -> TranscriptFetch {
            TranscriptFetch::Ready(Vec::new())
        }

        async fn fetch_user(&self, open_user_id: &str) -> Result<Option<RemoteUser>, ApiError> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.users.get(open_user_id).cloned())
        }

        async fn fetch_department(
            &self,
            department_id: i64,
        ) -> Result<Option<RemoteDepartment>, ApiError> {
            self.department_calls.fetch_add(1, Ordering::SeqCst);
            if self.department_should_fail {
                return Err(ApiError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            Ok(self.departments.get(&department_id).cloned())
        }
    }

    fn service(dir: &tempfile::TempDir, source: MockOrg) -> (SalesSyncService, Arc<MockOrg>) {
        let source = Arc::new(source);
        let db = Arc::new(Mutex::new(crate::db::open_test_db(dir)));
        (
            SalesSyncService::new(source.clone(), db),
            source,
        )
    }

    #[tokio::test]
    async fn test_sync_creates_person_with_department() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mock = MockOrg::new()
            .with_user("u1", "Zhang Wei", 12)
            .with_department(12, "North Sales");
        let (service, source) = service(&dir, mock);
        let caches = Mutex::new(RunCaches::new());

        service.sync_from_conversation("u1", &caches).await.unwrap();

        let person = service.db.lock().get_sales_person("u1").unwrap().unwrap();
        assert_eq!(person.name, "Zhang Wei");
        assert_eq!(person.department_name, "North Sales");
        assert_eq!(person.status, STATUS_NORMAL);
        assert!(person.log_info.is_none());

        // Second sync in the same run is served from the cache.
        service.sync_from_conversation("u1", &caches).await.unwrap();
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_user_gets_placeholder_row() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (service, _) = service(&dir, MockOrg::new());
        let caches = Mutex::new(RunCaches::new());

        service.sync_from_conversation("ghost", &caches).await.unwrap();

        let person = service.db.lock().get_sales_person("ghost").unwrap().unwrap();
        assert_eq!(person.status, STATUS_NOT_FOUND);
        assert_eq!(person.name, DEFAULT_FIELD);
        let log_info = person.log_info.expect("sync log recorded");
        assert!(log_info.contains(&CODE_USER_NOT_FOUND.to_string()));
    }

    #[tokio::test]
    async fn test_department_failure_degrades_but_row_is_written() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut mock = MockOrg::new().with_user("u1", "Zhang Wei", 12);
        mock.department_should_fail = true;
        let (service, _) = service(&dir, mock);
        let caches = Mutex::new(RunCaches::new());

        service.sync_from_conversation("u1", &caches).await.unwrap();

        let person = service.db.lock().get_sales_person("u1").unwrap().unwrap();
        assert_eq!(person.status, STATUS_NORMAL);
        assert_eq!(person.department_name, DEFAULT_FIELD);
        assert!(person
            .log_info
            .expect("sync log recorded")
            .contains("lookup failed"));
    }

    #[tokio::test]
    async fn test_department_cache_is_shared_across_people() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mock = MockOrg::new()
            .with_user("u1", "A", 12)
            .with_user("u2", "B", 12)
            .with_department(12, "North Sales");
        let (service, source) = service(&dir, mock);
        let caches = Mutex::new(RunCaches::new());

        service.sync_from_conversation("u1", &caches).await.unwrap();
        service.sync_from_conversation("u2", &caches).await.unwrap();

        assert_eq!(source.department_calls.load(Ordering::SeqCst), 1);
        let person = service.db.lock().get_sales_person("u2").unwrap().unwrap();
        assert_eq!(person.department_name, "North Sales");
    }
}
