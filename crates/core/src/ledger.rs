//! In-memory answers of the active attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AttemptId, OptionId, QuestionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("attempt {0} is no longer accepting answers")]
    Sealed(AttemptId),
}

/// Frozen copy of the ledger, used for scoring and persistence.
///
/// Serializable so a failed submission can be kept and replayed later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(QuestionId, OptionId)>", into = "Vec<(QuestionId, OptionId)>")]
pub struct AnswerSnapshot {
    answers: BTreeMap<QuestionId, OptionId>,
}

impl From<Vec<(QuestionId, OptionId)>> for AnswerSnapshot {
    fn from(pairs: Vec<(QuestionId, OptionId)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<AnswerSnapshot> for Vec<(QuestionId, OptionId)> {
    fn from(snapshot: AnswerSnapshot) -> Self {
        snapshot.answers.into_iter().collect()
    }
}

impl AnswerSnapshot {
    #[must_use]
    pub fn get(&self, question: QuestionId) -> Option<OptionId> {
        self.answers.get(&question).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QuestionId, OptionId)> + '_ {
        self.answers.iter().map(|(q, o)| (*q, *o))
    }
}

impl FromIterator<(QuestionId, OptionId)> for AnswerSnapshot {
    fn from_iter<I: IntoIterator<Item = (QuestionId, OptionId)>>(iter: I) -> Self {
        Self {
            answers: iter.into_iter().collect(),
        }
    }
}

/// Question → selected option map for one attempt.
///
/// Accepts writes until sealed; sealing happens when submission begins.
#[derive(Debug, Clone)]
pub struct AnswerLedger {
    attempt_id: AttemptId,
    answers: BTreeMap<QuestionId, OptionId>,
    sealed: bool,
}

impl AnswerLedger {
    #[must_use]
    pub fn new(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id,
            answers: BTreeMap::new(),
            sealed: false,
        }
    }

    /// Ledger pre-filled with answers persisted by an earlier run of the attempt.
    #[must_use]
    pub fn restore(
        attempt_id: AttemptId,
        answers: impl IntoIterator<Item = (QuestionId, OptionId)>,
    ) -> Self {
        Self {
            attempt_id,
            answers: answers.into_iter().collect(),
            sealed: false,
        }
    }

    #[must_use]
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// Record `option` for `question`, replacing any earlier choice.
    ///
    /// Returns the previous selection, if any.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Sealed` once the ledger stopped accepting answers.
    pub fn set(
        &mut self,
        question: QuestionId,
        option: OptionId,
    ) -> Result<Option<OptionId>, LedgerError> {
        if self.sealed {
            return Err(LedgerError::Sealed(self.attempt_id));
        }
        Ok(self.answers.insert(question, option))
    }

    #[must_use]
    pub fn get(&self, question: QuestionId) -> Option<OptionId> {
        self.answers.get(&question).copied()
    }

    #[must_use]
    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    /// Answers ordered by question id.
    pub fn entries(&self) -> impl Iterator<Item = (QuestionId, OptionId)> + '_ {
        self.answers.iter().map(|(q, o)| (*q, *o))
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Stop accepting answers and return the final snapshot.
    pub fn seal(&mut self) -> AnswerSnapshot {
        self.sealed = true;
        self.snapshot()
    }

    #[must_use]
    pub fn snapshot(&self) -> AnswerSnapshot {
        AnswerSnapshot {
            answers: self.answers.clone(),
        }
    }
}
