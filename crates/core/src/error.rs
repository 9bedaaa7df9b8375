use thiserror::Error;

use crate::ledger::LedgerError;
use crate::model::{AttemptError, QuestionError, ScoringRuleError, TestError};

/// Any domain validation failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Question(#[from] QuestionError),
    #[error(transparent)]
    Test(#[from] TestError),
    #[error(transparent)]
    ScoringRule(#[from] ScoringRuleError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
