//! Session tuning read from `EXAM_*` environment variables.

use std::time::Duration as StdDuration;

use chrono::Duration;
use exam_core::XpPolicy;

use crate::error::ConfigError;

const DEFAULT_RESUME_PROMPT_MINUTES: i64 = 120;
const DEFAULT_STALE_CLEANUP_HOURS: i64 = 24;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// When selected answers reach the data service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnswerPersistence {
    /// One batch upsert at submit.
    #[default]
    Batch,
    /// Every selection is upserted as it happens, then once more at submit.
    WriteThrough,
}

impl AnswerPersistence {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "batch" => Some(Self::Batch),
            "write-through" | "write_through" | "writethrough" => Some(Self::WriteThrough),
            _ => None,
        }
    }
}

/// Bounded retry for transient storage failures, with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: StdDuration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: StdDuration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single try, no waiting.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, StdDuration::ZERO)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> StdDuration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_MAX_ATTEMPTS,
            StdDuration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Age after which an unfinished attempt should prompt resume-or-restart.
    pub resume_prompt_after: Duration,
    /// Age after which background cleanup abandons an unfinished attempt.
    pub stale_cleanup_after: Duration,
    pub retry: RetryPolicy,
    pub answer_persistence: AnswerPersistence,
    pub xp_policy: XpPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resume_prompt_after: Duration::minutes(DEFAULT_RESUME_PROMPT_MINUTES),
            stale_cleanup_after: Duration::hours(DEFAULT_STALE_CLEANUP_HOURS),
            retry: RetryPolicy::default(),
            answer_persistence: AnswerPersistence::default(),
            xp_policy: XpPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Read overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset or blank keys keep their default.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a value is unparsable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(value) = get("EXAM_RESUME_PROMPT_MINUTES") {
            config.resume_prompt_after =
                Duration::minutes(parse_i64("EXAM_RESUME_PROMPT_MINUTES", value)?);
        }
        if let Some(value) = get("EXAM_STALE_CLEANUP_HOURS") {
            config.stale_cleanup_after =
                Duration::hours(parse_i64("EXAM_STALE_CLEANUP_HOURS", value)?);
        }

        let mut max_attempts = DEFAULT_RETRY_MAX_ATTEMPTS;
        let mut backoff_ms = DEFAULT_RETRY_BACKOFF_MS;
        if let Some(value) = get("EXAM_RETRY_MAX_ATTEMPTS") {
            max_attempts = value
                .parse::<u32>()
                .map_err(|_| invalid("EXAM_RETRY_MAX_ATTEMPTS", value))?;
        }
        if let Some(value) = get("EXAM_RETRY_BACKOFF_MS") {
            backoff_ms = value
                .parse::<u64>()
                .map_err(|_| invalid("EXAM_RETRY_BACKOFF_MS", value))?;
        }
        config.retry = RetryPolicy::new(max_attempts, StdDuration::from_millis(backoff_ms));

        if let Some(value) = get("EXAM_ANSWER_PERSISTENCE") {
            config.answer_persistence = AnswerPersistence::parse(&value)
                .ok_or_else(|| invalid("EXAM_ANSWER_PERSISTENCE", value))?;
        }
        if let Some(value) = get("EXAM_XP_POLICY") {
            config.xp_policy = XpPolicy::parse(&value)
                .ok_or_else(|| invalid("EXAM_XP_POLICY", value))?;
        }

        Ok(config)
    }
}

fn invalid(field: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { field, value }
}

fn parse_i64(field: &'static str, value: String) -> Result<i64, ConfigError> {
    match value.parse::<i64>() {
        Ok(parsed) if parsed >= 0 => Ok(parsed),
        _ => Err(invalid(field, value)),
    }
}
