//! The job entity and the value types used to create and update it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dedup::DedupKey;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, LockToken};
use crate::status::JobStatus;

/// Longest `payload_ref` / `owner_ref` / `result_ref` accepted (indexable column width).
pub const MAX_REF_LEN: usize = 191;

/// Longest locale tag accepted.
pub const MAX_LOCALE_LEN: usize = 32;

/// `last_error` is truncated to this many characters.
pub const MAX_ERROR_LEN: usize = 1000;

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Canonical job-type identifier selecting the handler
    pub job_type: String,
    /// Grouping key of the owning workflow; empty for standalone jobs
    pub owner_ref: String,
    pub locale: String,
    /// Short, indexable reference to the work item
    pub payload_ref: String,
    /// Serialized payload too large for `payload_ref`
    pub payload_body: Option<JsonValue>,
    pub dedup_key: DedupKey,
    /// Higher claims first
    pub priority: i32,
    /// Not claimable before this instant
    pub eligible_at: DateTime<Utc>,
    /// Backoff gate; `None` when no backoff is pending
    pub retry_not_before: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub lock_holder_ref: Option<LockToken>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Completed execution attempts
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The payload handed to handlers: the body when present, else the reference string.
    pub fn payload(&self) -> JsonValue {
        match &self.payload_body {
            Some(body) => body.clone(),
            None => JsonValue::String(self.payload_ref.clone()),
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.owner_ref.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_holder_ref.is_some()
    }

    /// Claimable right now: pending, past `eligible_at`, no backoff pending.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.eligible_at <= now
            && self.retry_not_before.is_none_or(|at| at <= now)
    }

    /// Lock fields are populated exactly when the status is active.
    pub fn lock_state_consistent(&self) -> bool {
        self.status.is_active() == self.lock_holder_ref.is_some()
            && self.lock_holder_ref.is_some() == self.lock_acquired_at.is_some()
    }
}

/// Everything needed to insert a job. The store assigns id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub owner_ref: String,
    pub locale: String,
    pub payload_ref: String,
    pub payload_body: Option<JsonValue>,
    pub dedup_key: DedupKey,
    pub priority: i32,
    pub eligible_at: DateTime<Utc>,
}

impl NewJob {
    /// Check field bounds and reject NUL characters, which text columns cannot
    /// store. Job-type membership is checked by the store.
    pub fn validate(&self) -> DomainResult<()> {
        check_text("job_type", &self.job_type, usize::MAX)?;
        check_text("payload_ref", &self.payload_ref, MAX_REF_LEN)?;
        check_text("owner_ref", &self.owner_ref, MAX_REF_LEN)?;
        check_text("locale", &self.locale, MAX_LOCALE_LEN)?;
        if self.payload_body.as_ref().is_some_and(contains_nul) {
            return Err(DomainError::validation("payload contains a NUL character"));
        }
        if self.payload_ref.trim().is_empty() && self.payload_body.is_none() {
            return Err(DomainError::validation("job has neither payload_ref nor payload_body"));
        }
        Ok(())
    }

    /// Materialise the pending job the store persists.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            owner_ref: self.owner_ref,
            locale: self.locale,
            payload_ref: self.payload_ref,
            payload_body: self.payload_body,
            dedup_key: self.dedup_key,
            priority: self.priority,
            eligible_at: self.eligible_at,
            retry_not_before: None,
            status: JobStatus::Pending,
            lock_holder_ref: None,
            lock_acquired_at: None,
            attempts: 0,
            last_error: None,
            result_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field updates applied together with an ownership-checked transition.
///
/// Lock fields and backoff are not patchable: the store derives them from the
/// target status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
    /// Count this transition as a completed execution attempt
    pub count_attempt: bool,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(truncate_chars(&result_ref.into(), MAX_REF_LEN));
        self
    }

    pub fn last_error(mut self, error: impl AsRef<str>) -> Self {
        self.last_error = Some(truncate_error(error.as_ref()));
        self
    }

    pub fn count_attempt(mut self) -> Self {
        self.count_attempt = true;
        self
    }
}

/// Bound an error message to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    truncate_chars(message, MAX_ERROR_LEN)
}

/// NUL is dropped: text columns cannot hold it.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max).collect()
}

/// `true` if any string or object key inside `value` holds a NUL character.
pub fn contains_nul(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => s.contains('\0'),
        JsonValue::Array(items) => items.iter().any(contains_nul),
        JsonValue::Object(map) => map
            .iter()
            .any(|(key, child)| key.contains('\0') || contains_nul(child)),
        _ => false,
    }
}

fn check_text(field: &str, value: &str, max: usize) -> DomainResult<()> {
    if value.contains('\0') {
        return Err(DomainError::validation(format!(
            "{field} contains a NUL character"
        )));
    }
    if value.chars().count() > max {
        return Err(DomainError::validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn new_job() -> NewJob {
        NewJob {
            job_type: "generate".to_string(),
            owner_ref: "run-1".to_string(),
            locale: "en".to_string(),
            payload_ref: "rust ownership".to_string(),
            payload_body: None,
            dedup_key: DedupKey::derive("run-1", "generate", "en", &json!("rust ownership")),
            priority: 0,
            eligible_at: Utc::now(),
        }
    }

    #[test]
    fn fresh_job_is_pending_and_unlocked() {
        let now = Utc::now();
        let job = new_job().into_job(JobId::new(1), now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.lock_state_consistent());
        assert_eq!(job.payload(), json!("rust ownership"));
    }

    #[test]
    fn eligibility_respects_both_gates() {
        let now = Utc::now();
        let mut job = new_job().into_job(JobId::new(1), now);
        job.eligible_at = now + Duration::minutes(5);
        assert!(!job.is_eligible(now));
        job.eligible_at = now;
        job.retry_not_before = Some(now + Duration::minutes(15));
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + Duration::minutes(15)));
    }

    #[test]
    fn validation_bounds_refs() {
        let mut job = new_job();
        job.payload_ref = "x".repeat(MAX_REF_LEN + 1);
        assert!(job.validate().is_err());

        let mut job = new_job();
        job.payload_ref = String::new();
        assert!(job.validate().is_err());
        job.payload_body = Some(json!({"k": "v"}));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn nul_characters_are_rejected_anywhere() {
        let mut job = new_job();
        job.owner_ref = "run\u{0}1".to_string();
        assert!(job.validate().is_err());

        let mut job = new_job();
        job.locale = "e\u{0}n".to_string();
        assert!(job.validate().is_err());

        let mut job = new_job();
        job.payload_body = Some(json!({"meta": [{"channel": "a\u{0}b"}]}));
        assert!(job.validate().is_err());

        let mut job = new_job();
        job.payload_body = Some(json!({"k\u{0}ey": 1}));
        assert!(job.validate().is_err());

        assert!(!contains_nul(&json!({"channel": "ab", "n": [1, null]})));
        let patch = JobPatch::new().last_error("bad\u{0}byte");
        assert_eq!(patch.last_error.as_deref(), Some("badbyte"));
    }

    #[test]
    fn error_messages_are_truncated_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        let patch = JobPatch::new().last_error(&long);
        assert_eq!(
            patch.last_error.as_ref().map(|e| e.chars().count()),
            Some(MAX_ERROR_LEN)
        );
        assert_eq!(truncate_error("short"), "short");
    }
}
