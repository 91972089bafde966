//! Conversation listing and transcript retrieval.
//!
//! Listing is paginated with an opaque `page_token`; only `doc` conversations
//! are kept. Transcript retrieval is two-step: the API returns a signed file
//! URL, then the content is downloaded with a separate long-timeout client.

use serde::{Deserialize, Serialize};

use crate::analyzer::TranscriptItem;

use super::{parse_envelope, send_with_retry, ApiClient, ApiError, CODE_TRANSCRIPT_NOT_READY};

pub const PAGE_SIZE: u32 = 100;
pub const DOC_CONVERSATION_TYPE: &str = "doc";

#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    pub origin_conversation_id: String,
    #[serde(default)]
    pub open_user_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl Conversation {
    pub fn is_doc(&self) -> bool {
        self.kind == DOC_CONVERSATION_TYPE
    }
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    begin_time: &'a str,
    end_time: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConversationPage {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptPointer {
    asr_file_url: String,
}

/// Outcome of transcript retrieval. Never an `Err`: transcript problems are
/// per-conversation diagnostics, not failures of the surrounding batch.
#[derive(Debug)]
pub enum TranscriptFetch {
    Ready(Vec<TranscriptItem>),
    /// Transcription still in progress on the remote side.
    NotReady,
    Failed {
        reason: String,
        detail: String,
    },
}

impl ApiClient {
    /// All `doc` conversations whose begin time falls in
    /// `[begin_time, end_time)`, following pagination to the end.
    pub async fn fetch_conversations(
        &self,
        begin_time: &str,
        end_time: &str,
    ) -> Result<Vec<Conversation>, ApiError> {
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page_no = 1u32;

        loop {
            let page = self
                .list_page(begin_time, end_time, page_token.as_deref())
                .await?;
            let before = all.len();
            all.extend(page.conversations.into_iter().filter(Conversation::is_doc));
            log::debug!(
                "conversation list page {}: {} doc conversations",
                page_no,
                all.len() - before
            );

            page_token = if page.has_more { page.page_token } else { None };
            if page_token.is_none() {
                break;
            }
            page_no += 1;
        }

        log::info!("fetched {} doc conversations", all.len());
        Ok(all)
    }

    async fn list_page(
        &self,
        begin_time: &str,
        end_time: &str,
        page_token: Option<&str>,
    ) -> Result<ConversationPage, ApiError> {
        let token = self.bearer().await?;
        let request = self
            .http
            .post(self.endpoint("/openapi/conversation/v1/conversations/list"))
            .bearer_auth(token)
            .json(&ListRequest {
                begin_time,
                end_time,
                page_size: PAGE_SIZE,
                page_token,
            });
        let response = send_with_retry(request, &self.policy).await?;
        parse_envelope(response).await
    }

    /// Fetch and decode one conversation's transcript.
    pub async fn fetch_transcript(&self, origin_conversation_id: &str) -> TranscriptFetch {
        let pointer = match self.fetch_transcript_pointer(origin_conversation_id).await {
            Ok(pointer) => pointer,
            Err(err) if err.business_code() == Some(CODE_TRANSCRIPT_NOT_READY) => {
                log::warn!(
                    "conversation {} transcription not finished",
                    origin_conversation_id
                );
                return TranscriptFetch::NotReady;
            }
            Err(err) => {
                log::warn!(
                    "conversation {} transcript location fetch failed: {}",
                    origin_conversation_id,
                    err
                );
                return TranscriptFetch::Failed {
                    reason: "transcript location fetch failed".to_string(),
                    detail: err.to_string(),
                };
            }
        };

        match self.download_transcript(&pointer.asr_file_url).await {
            Ok(items) => TranscriptFetch::Ready(items),
            Err(err) => {
                log::warn!(
                    "conversation {} transcript download failed: {}",
                    origin_conversation_id,
                    err
                );
                TranscriptFetch::Failed {
                    reason: "transcript download failed".to_string(),
                    detail: err.to_string(),
                }
            }
        }
    }

    async fn fetch_transcript_pointer(
        &self,
        origin_conversation_id: &str,
    ) -> Result<TranscriptPointer, ApiError> {
        let token = self.bearer().await?;
        let request = self
            .http
            .get(self.endpoint(&format!(
                "/openapi/conversation/v1/origin_conversations/{}/asr_data",
                origin_conversation_id
            )))
            .bearer_auth(token);
        let response = send_with_retry(request, &self.policy).await?;
        parse_envelope(response).await
    }

    async fn download_transcript(&self, url: &str) -> Result<Vec<TranscriptItem>, ApiError> {
        let response = send_with_retry(self.download.get(url), &self.policy).await?;
        let response = response.error_for_status()?;
        let items = response.json().await?;
        Ok(items)
    }
}
