use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{ExamId, OptionId, QuestionId, TestId};

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("question {0} has no options")]
    NoOptions(QuestionId),

    #[error("question {question} lists option {option} more than once")]
    DuplicateOption {
        question: QuestionId,
        option: OptionId,
    },

    #[error("question {0} marks more than one option as correct")]
    MultipleCorrect(QuestionId),

    #[error("question {0} has no correct option")]
    MissingCorrect(QuestionId),

    #[error("question {question} has a legacy answer that matches no option: {raw}")]
    UnresolvedLegacy { question: QuestionId, raw: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TestError {
    #[error("test duration must be positive")]
    InvalidDuration,

    #[error("question {0} appears more than once in the test")]
    DuplicateQuestion(QuestionId),
}

//
// ─── QUESTION ─────────────────────────────────────────────────────────────────
//

/// One selectable answer of a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    pub id: OptionId,
    pub text: String,
}

/// A validated question with exactly one authoritative correct option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    id: QuestionId,
    text: String,
    options: Vec<AnswerOption>,
    correct_option: OptionId,
}

impl Question {
    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn options(&self) -> &[AnswerOption] {
        &self.options
    }

    #[must_use]
    pub fn correct_option(&self) -> OptionId {
        self.correct_option
    }

    #[must_use]
    pub fn has_option(&self, option: OptionId) -> bool {
        self.options.iter().any(|o| o.id == option)
    }

    #[must_use]
    pub fn is_correct(&self, option: OptionId) -> bool {
        self.correct_option == option
    }
}

/// Correct-answer value stored directly on a question by older importers.
///
/// Only consulted when no option carries the correct marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyAnswer {
    OptionId(OptionId),
    /// Zero-based position in the option list.
    Index(usize),
    /// Option text, compared case-insensitively after trimming.
    Text(String),
}

/// Option as it arrives from the data service, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDraft {
    pub id: OptionId,
    pub text: String,
    pub is_correct: bool,
}

impl OptionDraft {
    #[must_use]
    pub fn new(id: OptionId, text: impl Into<String>, is_correct: bool) -> Self {
        Self {
            id,
            text: text.into(),
            is_correct,
        }
    }
}

/// Unvalidated question shape produced by adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionDraft {
    pub id: QuestionId,
    pub text: String,
    pub options: Vec<OptionDraft>,
    pub legacy_answer: Option<LegacyAnswer>,
}

impl QuestionDraft {
    #[must_use]
    pub fn new(id: QuestionId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            options: Vec::new(),
            legacy_answer: None,
        }
    }

    #[must_use]
    pub fn option(mut self, id: OptionId, text: impl Into<String>, is_correct: bool) -> Self {
        self.options.push(OptionDraft::new(id, text, is_correct));
        self
    }

    #[must_use]
    pub fn legacy(mut self, answer: LegacyAnswer) -> Self {
        self.legacy_answer = Some(answer);
        self
    }

    /// Resolve the canonical correct option and produce a `Question`.
    ///
    /// The per-option marker is authoritative; the legacy value is ignored
    /// whenever any option is marked.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` when options are missing or duplicated, more than
    /// one option is marked, or no correct option can be resolved.
    pub fn validate(self) -> Result<Question, QuestionError> {
        if self.options.is_empty() {
            return Err(QuestionError::NoOptions(self.id));
        }

        let mut seen = HashSet::with_capacity(self.options.len());
        for opt in &self.options {
            if !seen.insert(opt.id) {
                return Err(QuestionError::DuplicateOption {
                    question: self.id,
                    option: opt.id,
                });
            }
        }

        let mut marked = self.options.iter().filter(|o| o.is_correct);
        let correct_option = match (marked.next(), marked.next()) {
            (Some(_), Some(_)) => return Err(QuestionError::MultipleCorrect(self.id)),
            (Some(only), None) => only.id,
            (None, _) => self.resolve_legacy()?,
        };

        Ok(Question {
            id: self.id,
            text: self.text,
            options: self
                .options
                .into_iter()
                .map(|o| AnswerOption {
                    id: o.id,
                    text: o.text,
                })
                .collect(),
            correct_option,
        })
    }

    fn resolve_legacy(&self) -> Result<OptionId, QuestionError> {
        let unresolved = |raw: String| QuestionError::UnresolvedLegacy {
            question: self.id,
            raw,
        };

        match &self.legacy_answer {
            None => Err(QuestionError::MissingCorrect(self.id)),
            Some(LegacyAnswer::OptionId(id)) => self
                .options
                .iter()
                .find(|o| o.id == *id)
                .map(|o| o.id)
                .ok_or_else(|| unresolved(id.to_string())),
            Some(LegacyAnswer::Index(idx)) => self
                .options
                .get(*idx)
                .map(|o| o.id)
                .ok_or_else(|| unresolved(format!("index {idx}"))),
            Some(LegacyAnswer::Text(text)) => {
                let needle = text.trim();
                self.options
                    .iter()
                    .find(|o| o.text.trim().eq_ignore_ascii_case(needle))
                    .map(|o| o.id)
                    .ok_or_else(|| unresolved(text.clone()))
            }
        }
    }
}

//
// ─── TEST ─────────────────────────────────────────────────────────────────────
//

/// A fixed set of questions with a time limit, owned by an exam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Test {
    id: TestId,
    exam_id: ExamId,
    title: String,
    duration_minutes: u32,
    questions: Vec<Question>,
}

impl Test {
    /// Build a test from validated questions.
    ///
    /// An empty question list is accepted here; sessions refuse to start on it.
    ///
    /// # Errors
    ///
    /// Returns `TestError` for a zero duration or repeated question ids.
    pub fn new(
        id: TestId,
        exam_id: ExamId,
        title: impl Into<String>,
        duration_minutes: u32,
        questions: Vec<Question>,
    ) -> Result<Self, TestError> {
        if duration_minutes == 0 {
            return Err(TestError::InvalidDuration);
        }
        let mut seen = HashSet::with_capacity(questions.len());
        for q in &questions {
            if !seen.insert(q.id()) {
                return Err(TestError::DuplicateQuestion(q.id()));
            }
        }

        Ok(Self {
            id,
            exam_id,
            title: title.into(),
            duration_minutes,
            questions,
        })
    }

    #[must_use]
    pub fn id(&self) -> TestId {
        self.id
    }

    #[must_use]
    pub fn exam_id(&self) -> ExamId {
        self.exam_id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        u64::from(self.duration_minutes) * 60
    }

    #[must_use]
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    #[must_use]
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    #[must_use]
    pub fn question(&self, id: QuestionId) -> Option<&Question> {
        self.questions.iter().find(|q| q.id() == id)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: u64) -> QuestionDraft {
        QuestionDraft::new(QuestionId::new(id), format!("Q{id}"))
    }

    #[test]
    fn marked_option_is_canonical() {
        let q = draft(1)
            .option(OptionId::new(10), "A", false)
            .option(OptionId::new(11), "B", true)
            .validate()
            .unwrap();
        assert_eq!(q.correct_option(), OptionId::new(11));
        assert!(q.is_correct(OptionId::new(11)));
        assert!(!q.is_correct(OptionId::new(10)));
    }

    #[test]
    fn marker_wins_over_conflicting_legacy_value() {
        let q = draft(1)
            .option(OptionId::new(10), "A", true)
            .option(OptionId::new(11), "B", false)
            .legacy(LegacyAnswer::Index(1))
            .validate()
            .unwrap();
        assert_eq!(q.correct_option(), OptionId::new(10));
    }

    #[test]
    fn legacy_index_and_text_resolve_when_unmarked() {
        let by_index = draft(1)
            .option(OptionId::new(10), "Paris", false)
            .option(OptionId::new(11), "Rome", false)
            .legacy(LegacyAnswer::Index(1))
            .validate()
            .unwrap();
        assert_eq!(by_index.correct_option(), OptionId::new(11));

        let by_text = draft(2)
            .option(OptionId::new(20), "Paris", false)
            .option(OptionId::new(21), "Rome", false)
            .legacy(LegacyAnswer::Text("  paris ".into()))
            .validate()
            .unwrap();
        assert_eq!(by_text.correct_option(), OptionId::new(20));
    }

    #[test]
    fn rejects_ambiguous_or_missing_correct_option() {
        let err = draft(1)
            .option(OptionId::new(10), "A", true)
            .option(OptionId::new(11), "B", true)
            .validate()
            .unwrap_err();
        assert_eq!(err, QuestionError::MultipleCorrect(QuestionId::new(1)));

        let err = draft(2)
            .option(OptionId::new(20), "A", false)
            .validate()
            .unwrap_err();
        assert_eq!(err, QuestionError::MissingCorrect(QuestionId::new(2)));

        let err = draft(3)
            .option(OptionId::new(30), "A", false)
            .legacy(LegacyAnswer::Index(4))
            .validate()
            .unwrap_err();
        assert!(matches!(err, QuestionError::UnresolvedLegacy { .. }));
    }

    #[test]
    fn rejects_duplicate_options_and_empty_questions() {
        let err = draft(1).validate().unwrap_err();
        assert_eq!(err, QuestionError::NoOptions(QuestionId::new(1)));

        let err = draft(2)
            .option(OptionId::new(20), "A", true)
            .option(OptionId::new(20), "B", false)
            .validate()
            .unwrap_err();
        assert!(matches!(err, QuestionError::DuplicateOption { .. }));
    }

    #[test]
    fn test_rejects_duplicate_questions_and_zero_duration() {
        let q = draft(1)
            .option(OptionId::new(10), "A", true)
            .validate()
            .unwrap();

        let err = Test::new(TestId::new(1), ExamId::new(1), "T", 0, vec![q.clone()]).unwrap_err();
        assert_eq!(err, TestError::InvalidDuration);

        let err =
            Test::new(TestId::new(1), ExamId::new(1), "T", 30, vec![q.clone(), q]).unwrap_err();
        assert_eq!(err, TestError::DuplicateQuestion(QuestionId::new(1)));
    }

    #[test]
    fn test_exposes_duration_and_lookup() {
        let q = draft(7)
            .option(OptionId::new(70), "A", true)
            .validate()
            .unwrap();
        let test = Test::new(TestId::new(3), ExamId::new(2), "Mock", 45, vec![q]).unwrap();
        assert_eq!(test.duration_seconds(), 2700);
        assert_eq!(test.question_count(), 1);
        assert!(test.question(QuestionId::new(7)).is_some());
        assert!(test.question(QuestionId::new(8)).is_none());
    }
}
