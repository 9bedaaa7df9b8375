//! Shared error types for the services crate.

use std::fmt;

use thiserror::Error;

use exam_core::model::{AttemptId, AttemptStatus, OptionId, QuestionId, TestId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

use crate::sessions::SessionState;

/// Errors emitted by `AttemptManager`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttemptManagerError {
    #[error("attempt {0} not found or not in progress")]
    NotFound(AttemptId),
    #[error("attempt {attempt} cannot be finalized from {from}")]
    InvalidTransition {
        attempt: AttemptId,
        from: AttemptStatus,
    },
    #[error("could not settle on a single active attempt")]
    ConflictingAttempt,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `XpAwarder`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum XpAwardError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a `SessionError::NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Test(TestId),
    Attempt(AttemptId),
    Question(QuestionId),
    Option {
        question: QuestionId,
        option: OptionId,
    },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Test(id) => write!(f, "test {id}"),
            Missing::Attempt(id) => write!(f, "attempt {id}"),
            Missing::Question(id) => write!(f, "question {id}"),
            Missing::Option { question, option } => {
                write!(f, "option {option} of question {question}")
            }
        }
    }
}

/// Errors emitted by `SessionOrchestrator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("test {0} has no questions")]
    NoQuestions(TestId),
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("attempt {attempt} is already {from}")]
    InvalidTransition {
        attempt: AttemptId,
        from: AttemptStatus,
    },
    #[error("could not settle on a single active attempt")]
    ConflictingAttempt,
    #[error("submission of attempt {attempt} failed; answers are kept for retry")]
    SubmissionFailed {
        attempt: AttemptId,
        #[source]
        source: StorageError,
    },
    #[error("session was cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Errors that block the session for good; everything else can be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::NoQuestions(_) | SessionError::NotFound(Missing::Test(_))
        )
    }
}

impl From<AttemptManagerError> for SessionError {
    fn from(err: AttemptManagerError) -> Self {
        match err {
            AttemptManagerError::NotFound(id) => SessionError::NotFound(Missing::Attempt(id)),
            AttemptManagerError::InvalidTransition { attempt, from } => {
                SessionError::InvalidTransition { attempt, from }
            }
            AttemptManagerError::ConflictingAttempt => SessionError::ConflictingAttempt,
            AttemptManagerError::Storage(e) => SessionError::Storage(e),
        }
    }
}

impl From<XpAwardError> for SessionError {
    fn from(err: XpAwardError) -> Self {
        match err {
            XpAwardError::Storage(e) => SessionError::Storage(e),
        }
    }
}

/// Storage-backed errors that are worth retrying with the same input.
pub(crate) trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

impl Transient for XpAwardError {
    fn is_transient(&self) -> bool {
        match self {
            XpAwardError::Storage(e) => e.is_transient(),
        }
    }
}

impl Transient for AttemptManagerError {
    fn is_transient(&self) -> bool {
        matches!(self, AttemptManagerError::Storage(e) if e.is_transient())
    }
}

/// Errors raised while reading `SessionConfig` from the environment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
