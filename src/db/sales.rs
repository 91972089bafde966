use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{map_sales_person_row, DbError, DbSalesPerson, MetricsDb};

impl MetricsDb {
    // =========================================================================
    // Sales people (upsert dimension)
    // =========================================================================

    /// Insert or refresh a salesperson row. Returns true when the row was
    /// newly created. On update, `log_info` is only overwritten when the
    /// incoming record carries one; otherwise the stored value is kept.
    pub fn upsert_sales_person(&self, person: &DbSalesPerson) -> Result<bool, DbError> {
        let existed = self.sales_person_exists(&person.open_user_id)?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO sales_people (
                open_user_id, name, main_department_id, is_delete, status,
                department_name, parent_department_id, lead_open_user_id,
                log_info, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(open_user_id) DO UPDATE SET
                name = excluded.name,
                main_department_id = excluded.main_department_id,
                is_delete = excluded.is_delete,
                status = excluded.status,
                department_name = excluded.department_name,
                parent_department_id = excluded.parent_department_id,
                lead_open_user_id = excluded.lead_open_user_id,
                log_info = COALESCE(excluded.log_info, sales_people.log_info),
                updated_at = excluded.updated_at",
            params![
                person.open_user_id,
                person.name,
                person.main_department_id,
                person.is_delete as i64,
                person.status,
                person.department_name,
                person.parent_department_id,
                person.lead_open_user_id,
                person.log_info,
                now,
            ],
        )?;
        Ok(!existed)
    }

    pub fn sales_person_exists(&self, open_user_id: &str) -> Result<bool, DbError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sales_people WHERE open_user_id = ?1)",
            params![open_user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_sales_person(&self, open_user_id: &str) -> Result<Option<DbSalesPerson>, DbError> {
        let person = self
            .conn
            .query_row(
                "SELECT open_user_id, name, main_department_id, is_delete, status,
                        department_name, parent_department_id, lead_open_user_id,
                        log_info, created_at, updated_at
                 FROM sales_people WHERE open_user_id = ?1",
                params![open_user_id],
                map_sales_person_row,
            )
            .optional()?;
        Ok(person)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;

    fn sample_person(open_user_id: &str) -> DbSalesPerson {
        DbSalesPerson {
            open_user_id: open_user_id.to_string(),
            name: "Zhang Wei".to_string(),
            main_department_id: 12,
            is_delete: false,
            status: "normal".to_string(),
            department_name: "North Sales".to_string(),
            parent_department_id: 3,
            lead_open_user_id: "lead-1".to_string(),
            log_info: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = open_test_db(&dir);

        assert!(db.upsert_sales_person(&sample_person("user-1")).unwrap());

        let mut renamed = sample_person("user-1");
        renamed.name = "Zhang W.".to_string();
        assert!(!db.upsert_sales_person(&renamed).unwrap());

        let row = db.get_sales_person("user-1").unwrap().unwrap();
        assert_eq!(row.name, "Zhang W.");
    }

    #[test]
    fn test_update_without_log_info_keeps_existing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = open_test_db(&dir);

        let mut with_log = sample_person("user-1");
        with_log.log_info = Some("[\"department 3 lookup failed\"]".to_string());
        db.upsert_sales_person(&with_log).unwrap();

        // A later sync that saw no problems must not erase the diagnostics.
        db.upsert_sales_person(&sample_person("user-1")).unwrap();

        let row = db.get_sales_person("user-1").unwrap().unwrap();
        assert_eq!(
            row.log_info.as_deref(),
            Some("[\"department 3 lookup failed\"]")
        );
    }

    #[test]
    fn test_missing_person_is_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = open_test_db(&dir);
        assert!(db.get_sales_person("nobody").unwrap().is_none());
    }
}
