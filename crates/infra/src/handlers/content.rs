use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use pressqueue_core::JobResult;

use super::result_from_error;
use crate::collaborators::{ContentGenerator, GenerationRequest, Publisher};
use crate::jobs::registry::{JobContext, JobHandler};

/// Generates an article and publishes it; `result_ref` is the published artifact.
pub struct ContentGenerationHandler {
    generator: Arc<dyn ContentGenerator>,
    publisher: Arc<dyn Publisher>,
    max_attempts: Option<u32>,
}

impl ContentGenerationHandler {
    pub fn new(generator: Arc<dyn ContentGenerator>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            generator,
            publisher,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[async_trait]
impl JobHandler for ContentGenerationHandler {
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> JobResult {
        let request = GenerationRequest {
            job_id: ctx.job_id,
            owner_ref: ctx.owner_ref.clone(),
            locale: ctx.locale.clone(),
            payload: payload.clone(),
        };

        let content = match self.generator.generate(&request).await {
            Ok(content) => content,
            Err(e) => return result_from_error("generate", e),
        };

        let published = match self.publisher.publish(&content, &request).await {
            Ok(reference) => reference,
            Err(e) => return result_from_error("publish", e),
        };

        debug!(
            job_id = %ctx.job_id,
            result_ref = %published,
            tokens = content.usage.total_tokens(),
            "content published"
        );

        let mut result = JobResult::success()
            .with_result_ref(published)
            .with_data(json!({
                "title": content.title,
                "usage": content.usage,
            }));
        if let Some(score) = content.quality_score {
            result = result.with_quality_score(score);
        }
        result
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}
