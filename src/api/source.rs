//! Trait seam over the remote conversation platform.
//!
//! The collector and sync services depend on this trait rather than the
//! concrete client, so tests can drive them with an in-memory source.

use async_trait::async_trait;

use super::conversations::{Conversation, TranscriptFetch};
use super::org::{RemoteDepartment, RemoteUser};
use super::{ApiClient, ApiError};

#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// All `doc` conversations in `[begin_time, end_time)`.
    async fn fetch_conversations(
        &self,
        begin_time: &str,
        end_time: &str,
    ) -> Result<Vec<Conversation>, ApiError>;

    async fn fetch_transcript(&self, origin_conversation_id: &str) -> TranscriptFetch;

    async fn fetch_user(&self, open_user_id: &str) -> Result<Option<RemoteUser>, ApiError>;

    async fn fetch_department(
        &self,
        department_id: i64,
    ) -> Result<Option<RemoteDepartment>, ApiError>;
}

#[async_trait]
impl ConversationSource for ApiClient {
    async fn fetch_conversations(
        &self,
        begin_time: &str,
        end_time: &str,
    ) -> Result<Vec<Conversation>, ApiError> {
        ApiClient::fetch_conversations(self, begin_time, end_time).await
    }

    async fn fetch_transcript(&self, origin_conversation_id: &str) -> TranscriptFetch {
        ApiClient::fetch_transcript(self, origin_conversation_id).await
    }

    async fn fetch_user(&self, open_user_id: &str) -> Result<Option<RemoteUser>, ApiError> {
        ApiClient::fetch_user(self, open_user_id).await
    }

    async fn fetch_department(
        &self,
        department_id: i64,
    ) -> Result<Option<RemoteDepartment>, ApiError> {
        ApiClient::fetch_department(self, department_id).await
    }
}
