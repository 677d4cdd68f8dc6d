//! Queue tuning, read from `PRESSQUEUE_*` environment variables.

use std::time::Duration;

use pressqueue_core::{BackoffPolicy, RetryPolicy};

const MINUTE: u64 = 60;
const DAY: u64 = 86_400;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Jobs processed per scheduler run
    pub batch_size: usize,
    /// Wall-clock budget of one scheduler run
    pub time_budget: Duration,
    pub retry: RetryPolicy,
    /// Active jobs locked longer than this are released by maintenance
    pub lock_timeout: Duration,
    pub done_retention: Duration,
    pub failed_retention: Duration,
    /// TTL of the advisory run lock around scheduler/maintenance runs
    pub run_lock_ttl: Duration,
    /// Successful results scoring below this end in `needs_review`
    pub review_threshold: Option<f64>,
    pub worker_interval: Duration,
    pub maintenance_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            time_budget: Duration::from_secs(50),
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(30 * MINUTE),
            done_retention: Duration::from_secs(30 * DAY),
            failed_retention: Duration::from_secs(60 * DAY),
            run_lock_ttl: Duration::from_secs(120),
            review_threshold: None,
            worker_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(DAY),
        }
    }
}

impl QueueConfig {
    /// Read overrides from the process environment. Unset variables keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read overrides through `lookup` (variable name -> value).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup };

        let base = env.u64("PRESSQUEUE_BACKOFF_BASE_MINUTES")?;
        let cap = env.u64("PRESSQUEUE_BACKOFF_CAP_MINUTES")?;
        let backoff = BackoffPolicy::new(
            base.map_or(defaults.retry.backoff.base, mins),
            cap.map_or(defaults.retry.backoff.cap, mins),
        );

        let max_attempts = match env.u64("PRESSQUEUE_MAX_ATTEMPTS")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "PRESSQUEUE_MAX_ATTEMPTS",
                    expected: "a positive integer",
                    value: "0".to_string(),
                });
            }
            Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
            None => defaults.retry.default_max_attempts,
        };

        let review_threshold = env
            .f64("PRESSQUEUE_REVIEW_THRESHOLD")?
            .or(defaults.review_threshold);

        Ok(Self {
            batch_size: env
                .u64("PRESSQUEUE_BATCH_SIZE")?
                .map_or(defaults.batch_size, saturating_usize),
            time_budget: env
                .u64("PRESSQUEUE_TIME_BUDGET_SECS")?
                .map_or(defaults.time_budget, Duration::from_secs),
            retry: RetryPolicy {
                default_max_attempts: max_attempts,
                backoff,
            },
            lock_timeout: env
                .u64("PRESSQUEUE_LOCK_TIMEOUT_MINUTES")?
                .map_or(defaults.lock_timeout, mins),
            done_retention: env
                .u64("PRESSQUEUE_DONE_RETENTION_DAYS")?
                .map_or(defaults.done_retention, days),
            failed_retention: env
                .u64("PRESSQUEUE_FAILED_RETENTION_DAYS")?
                .map_or(defaults.failed_retention, days),
            run_lock_ttl: env
                .u64("PRESSQUEUE_RUN_LOCK_TTL_SECS")?
                .map_or(defaults.run_lock_ttl, Duration::from_secs),
            review_threshold,
            worker_interval: env
                .u64("PRESSQUEUE_WORKER_INTERVAL_SECS")?
                .map_or(defaults.worker_interval, Duration::from_secs),
            maintenance_interval: env
                .u64("PRESSQUEUE_MAINTENANCE_INTERVAL_SECS")?
                .map_or(defaults.maintenance_interval, Duration::from_secs),
        })
    }
}

fn saturating_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn mins(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(MINUTE))
}

fn days(d: u64) -> Duration {
    Duration::from_secs(d.saturating_mul(DAY))
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, var: &'static str) -> Result<Option<u64>, ConfigError> {
        self.raw(var)
            .map(|v| {
                v.parse().map_err(|_| ConfigError::Invalid {
                    var,
                    expected: "a non-negative integer",
                    value: v,
                })
            })
            .transpose()
    }

    fn f64(&self, var: &'static str) -> Result<Option<f64>, ConfigError> {
        self.raw(var)
            .map(|v| match v.parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                _ => Err(ConfigError::Invalid {
                    var,
                    expected: "a finite number",
                    value: v,
                }),
            })
            .transpose()
    }
}
