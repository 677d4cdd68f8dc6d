//! Contracts of the external services job handlers call.
//!
//! The queue never looks inside these; handlers translate their errors into
//! [`JobResult`](pressqueue_core::JobResult)s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pressqueue_core::JobId;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Worth retrying (rate limit, timeout, 5xx).
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help (bad input, rejected credentials).
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Token accounting reported by the generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageStats {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// What the generator is asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub job_id: JobId,
    /// Owning content run; empty for standalone jobs
    pub owner_ref: String,
    pub locale: String,
    pub payload: JsonValue,
}

/// A generated article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub title: String,
    pub body: String,
    /// SEO / taxonomy metadata, passed through to the publisher
    #[serde(default)]
    pub metadata: JsonValue,
    #[serde(default)]
    pub usage: UsageStats,
    /// 0.0..=1.0; absent when the generator does not score its output
    #[serde(default)]
    pub quality_score: Option<f64>,
}

/// Produces content from a job payload.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedContent, CollaboratorError>;
}

/// Stores generated content in the CMS.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the created artifact reference (e.g. `post:42`).
    async fn publish(
        &self,
        content: &GeneratedContent,
        request: &GenerationRequest,
    ) -> Result<String, CollaboratorError>;
}

/// Channel reply to a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub success: bool,
    pub message: String,
    pub external_id: Option<String>,
}

/// What a channel is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub job_id: JobId,
    /// Published artifact being distributed
    pub content_ref: String,
    pub locale: String,
    /// Channel-specific extras from the job payload
    #[serde(default)]
    pub options: JsonValue,
}

/// A distribution destination (CMS, social network, ...).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// `Err` carries a human-readable reason.
    fn validate_configuration(&self) -> Result<(), String>;

    async fn deliver(&self, delivery: &ChannelDelivery)
    -> Result<ChannelResponse, CollaboratorError>;
}

pub mod stub {
    //! Offline collaborators for development and tests.

    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Builds a placeholder article from the payload's `topic` (or the payload itself).
    #[derive(Debug, Default)]
    pub struct TemplateGenerator;

    #[async_trait]
    impl ContentGenerator for TemplateGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GeneratedContent, CollaboratorError> {
            let topic = match &request.payload {
                JsonValue::String(s) => s.clone(),
                other => other
                    .get("topic")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CollaboratorError::Permanent("payload has no topic".to_string())
                    })?,
            };

            let body = format!("Draft about {topic}.");
            Ok(GeneratedContent {
                title: topic.clone(),
                usage: UsageStats {
                    prompt_tokens: topic.split_whitespace().count() as u64,
                    completion_tokens: body.split_whitespace().count() as u64,
                },
                body,
                metadata: JsonValue::Null,
                quality_score: None,
            })
        }
    }

    /// Hands out sequential `draft:<n>` references without storing anything.
    #[derive(Debug, Default)]
    pub struct DraftPublisher {
        next: AtomicU64,
    }

    #[async_trait]
    impl Publisher for DraftPublisher {
        async fn publish(
            &self,
            content: &GeneratedContent,
            request: &GenerationRequest,
        ) -> Result<String, CollaboratorError> {
            let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(job_id = %request.job_id, title = %content.title, "draft published");
            Ok(format!("draft:{n}"))
        }
    }
}
