//! Outcome of executing one job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Outcome class reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Transient failure; drives backoff until attempts run out
    Retryable,
    /// Non-retryable failure; terminal immediately
    Permanent,
}

/// Immutable result of executing one job.
///
/// Every variant can carry arbitrary result data; failures carry a message and
/// may carry a custom retry delay overriding the store's backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    outcome: Outcome,
    message: Option<String>,
    data: JsonValue,
    result_ref: Option<String>,
    quality_score: Option<f64>,
    retry_delay: Option<Duration>,
}

impl JobResult {
    fn with_outcome(outcome: Outcome, message: Option<String>) -> Self {
        Self {
            outcome,
            message,
            data: JsonValue::Null,
            result_ref: None,
            quality_score: None,
            retry_delay: None,
        }
    }

    pub fn success() -> Self {
        Self::with_outcome(Outcome::Success, None)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Retryable, Some(message.into()))
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Permanent, Some(message.into()))
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    /// Reference to the produced artifact (e.g. `post:42`).
    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    /// Quality score compared against the caller's review threshold.
    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn result_ref(&self) -> Option<&str> {
        self.result_ref.as_deref()
    }

    pub fn quality_score(&self) -> Option<f64> {
        self.quality_score
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    /// Whether a successful result must be held for review.
    ///
    /// Results without a score never trip the gate.
    pub fn needs_review(&self, threshold: Option<f64>) -> bool {
        match (self.quality_score, threshold) {
            (Some(score), Some(threshold)) => self.is_success() && score < threshold,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_keep_outcome() {
        let ok = JobResult::success()
            .with_result_ref("post:42")
            .with_data(serde_json::json!({"tokens": 812}));
        assert!(ok.is_success());
        assert_eq!(ok.result_ref(), Some("post:42"));
        assert_eq!(ok.data()["tokens"], 812);

        let retry = JobResult::retryable("rate limited").with_retry_delay(Duration::from_secs(90));
        assert_eq!(retry.outcome(), Outcome::Retryable);
        assert_eq!(retry.message(), Some("rate limited"));
        assert_eq!(retry.retry_delay(), Some(Duration::from_secs(90)));

        assert_eq!(JobResult::permanent("bad key").outcome(), Outcome::Permanent);
    }

    #[test]
    fn review_gate() {
        let scored = JobResult::success().with_quality_score(0.4);
        assert!(scored.needs_review(Some(0.6)));
        assert!(!scored.needs_review(Some(0.3)));
        assert!(!scored.needs_review(None));
        assert!(!JobResult::success().needs_review(Some(0.6)));
        assert!(!JobResult::retryable("x").with_quality_score(0.1).needs_review(Some(0.6)));
    }
}
