//! Marking of a finished answer set. Pure and deterministic.

use serde::{Deserialize, Serialize};

use crate::ledger::AnswerSnapshot;
use crate::model::{AnswerRecord, AttemptId, Question, ScoringRule};

/// Per-category counts and marks for one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub correct: u32,
    pub incorrect: u32,
    pub unanswered: u32,
    pub correct_marks: f64,
    /// Marks deducted for incorrect answers, as a non-negative amount.
    pub negative_marks: f64,
    /// Signed sum of the unanswered weight.
    pub unanswered_marks: f64,
    pub total_marks: f64,
    pub max_possible_marks: f64,
}

impl ScoreBreakdown {
    #[must_use]
    pub fn total_questions(&self) -> u32 {
        self.correct
            .saturating_add(self.incorrect)
            .saturating_add(self.unanswered)
    }

    #[must_use]
    pub fn answered(&self) -> u32 {
        self.correct.saturating_add(self.incorrect)
    }

    /// Share of all questions answered correctly, in percent.
    #[must_use]
    pub fn accuracy_percent(&self) -> f64 {
        let total = self.total_questions();
        if total == 0 {
            return 0.0;
        }
        f64::from(self.correct) * 100.0 / f64::from(total)
    }
}

/// Score `answers` against `questions` using `rule`.
///
/// Answers for questions outside `questions` are ignored. An answer is
/// correct only when it matches the question's canonical correct option.
#[must_use]
pub fn score(questions: &[Question], answers: &AnswerSnapshot, rule: &ScoringRule) -> ScoreBreakdown {
    let mut correct = 0_u32;
    let mut incorrect = 0_u32;
    let mut unanswered = 0_u32;

    for question in questions {
        match answers.get(question.id()) {
            Some(option) if question.is_correct(option) => correct = correct.saturating_add(1),
            Some(_) => incorrect = incorrect.saturating_add(1),
            None => unanswered = unanswered.saturating_add(1),
        }
    }

    let correct_marks = f64::from(correct) * rule.marks_correct();
    let negative_marks = f64::from(incorrect) * rule.penalty_incorrect();
    let unanswered_marks = f64::from(unanswered) * rule.marks_unanswered();
    let total = correct.saturating_add(incorrect).saturating_add(unanswered);

    ScoreBreakdown {
        correct,
        incorrect,
        unanswered,
        correct_marks,
        negative_marks,
        unanswered_marks,
        total_marks: correct_marks - negative_marks + unanswered_marks,
        max_possible_marks: f64::from(total) * rule.marks_correct(),
    }
}

/// Answer records (with correctness) for every answered question of the test.
#[must_use]
pub fn answer_records(
    attempt_id: AttemptId,
    questions: &[Question],
    answers: &AnswerSnapshot,
) -> Vec<AnswerRecord> {
    questions
        .iter()
        .filter_map(|q| {
            answers
                .get(q.id())
                .map(|option| AnswerRecord::for_question(attempt_id, q, option))
        })
        .collect()
}
