//! User and department lookup.
//!
//! Not-found is an expected condition for both endpoints (conversations can
//! reference removed people) and is surfaced as `Ok(None)` rather than an
//! error, so callers only propagate genuine transport failures.

use serde::Deserialize;

use super::{
    parse_envelope, send_with_retry, ApiClient, ApiError, CODE_DEPARTMENT_NOT_FOUND,
    CODE_USER_NOT_FOUND,
};

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main_department_id: Option<i64>,
    #[serde(default)]
    pub status: Option<RemoteUserStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUserStatus {
    #[serde(default)]
    pub is_delete: bool,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: RemoteUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDepartment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_department_id: Option<i64>,
    #[serde(default)]
    pub lead_open_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepartmentData {
    department: RemoteDepartment,
}

/// Map a tolerated business code to `Ok(None)`; everything else propagates.
fn tolerate_missing<T>(result: Result<T, ApiError>, code: i64) -> Result<Option<T>, ApiError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.business_code() == Some(code) => Ok(None),
        Err(err) => Err(err),
    }
}

impl ApiClient {
    pub async fn fetch_user(&self, open_user_id: &str) -> Result<Option<RemoteUser>, ApiError> {
        let result = self
            .get_envelope::<UserData>(&format!(
                "/openapi/organization/v1/users/{}",
                open_user_id
            ))
            .await
            .map(|data| data.user);
        let user = tolerate_missing(result, CODE_USER_NOT_FOUND)?;
        if user.is_none() {
            log::warn!("user {} not found", open_user_id);
        }
        Ok(user)
    }

    pub async fn fetch_department(
        &self,
        department_id: i64,
    ) -> Result<Option<RemoteDepartment>, ApiError> {
        let result = self
            .get_envelope::<DepartmentData>(&format!(
                "/openapi/organization/v1/departments/{}",
                department_id
            ))
            .await
            .map(|data| data.department);
        let department = tolerate_missing(result, CODE_DEPARTMENT_NOT_FOUND)?;
        if department.is_none() {
            log::warn!("department {} not found", department_id);
        }
        Ok(department)
    }

    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ApiError> {
        let token = self.bearer().await?;
        let request = self.http.get(self.endpoint(path)).bearer_auth(token);
        let response = send_with_retry(request, &self.policy).await?;
        parse_envelope(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_payload_deserializes() {
        let json = r#"{
            "user": {
                "name": "Zhang Wei",
                "main_department_id": 12,
                "status": {"is_delete": false}
            }
        }"#;
        let data: UserData = serde_json::from_str(json).unwrap();
        assert_eq!(data.user.name.as_deref(), Some("Zhang Wei"));
        assert_eq!(data.user.main_department_id, Some(12));
        assert!(!data.user.status.unwrap().is_delete);
    }

    #[test]
    fn test_sparse_user_payload_deserializes() {
        let data: UserData = serde_json::from_str(r#"{"user": {}}"#).unwrap();
        assert!(data.user.name.is_none());
        assert!(data.user.main_department_id.is_none());
        assert!(data.user.status.is_none());
    }

    #[test]
    fn test_tolerate_missing_maps_only_expected_code() {
        let not_found: Result<(), ApiError> = Err(ApiError::Business {
            code: CODE_USER_NOT_FOUND,
            message: "no such user".to_string(),
        });
        assert!(tolerate_missing(not_found, CODE_USER_NOT_FOUND)
            .unwrap()
            .is_none());

        let other: Result<(), ApiError> = Err(ApiError::Business {
            code: 500_000,
            message: "server fault".to_string(),
        });
        assert!(tolerate_missing(other, CODE_USER_NOT_FOUND).is_err());
    }
}
