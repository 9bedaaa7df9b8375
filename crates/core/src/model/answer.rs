use serde::{Deserialize, Serialize};

use crate::model::ids::{AttemptId, OptionId, QuestionId};
use crate::model::catalog::Question;

/// Persisted answer of one question within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub attempt_id: AttemptId,
    pub question_id: QuestionId,
    pub option_id: OptionId,
    pub is_correct: bool,
}

impl AnswerRecord {
    /// Derive the record for `option` selected on `question`.
    #[must_use]
    pub fn for_question(attempt_id: AttemptId, question: &Question, option: OptionId) -> Self {
        Self {
            attempt_id,
            question_id: question.id(),
            option_id: option,
            is_correct: question.is_correct(option),
        }
    }
}
