use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ScoringRuleError {
    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },
}

/// Per-exam marking scheme.
///
/// The incorrect-answer weight is accepted either signed (`-0.5`) or as a
/// magnitude (`0.5`) and is always held as a non-negative penalty. The
/// unanswered weight keeps its sign and is added as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    marks_correct: f64,
    penalty_incorrect: f64,
    marks_unanswered: f64,
}

impl ScoringRule {
    /// # Errors
    ///
    /// Returns `ScoringRuleError::NotFinite` if any weight is NaN or infinite.
    pub fn new(
        marks_correct: f64,
        marks_incorrect: f64,
        marks_unanswered: f64,
    ) -> Result<Self, ScoringRuleError> {
        for (field, value) in [
            ("marks_correct", marks_correct),
            ("marks_incorrect", marks_incorrect),
            ("marks_unanswered", marks_unanswered),
        ] {
            if !value.is_finite() {
                return Err(ScoringRuleError::NotFinite { field, value });
            }
        }

        Ok(Self {
            marks_correct,
            penalty_incorrect: marks_incorrect.abs(),
            marks_unanswered,
        })
    }

    /// One mark per correct answer, nothing else.
    ///
    /// Used for exams that never had a rule configured.
    #[must_use]
    pub fn exam_default() -> Self {
        Self {
            marks_correct: 1.0,
            penalty_incorrect: 0.0,
            marks_unanswered: 0.0,
        }
    }

    #[must_use]
    pub fn marks_correct(&self) -> f64 {
        self.marks_correct
    }

    /// Marks deducted per incorrect answer (never negative).
    #[must_use]
    pub fn penalty_incorrect(&self) -> f64 {
        self.penalty_incorrect
    }

    #[must_use]
    pub fn marks_unanswered(&self) -> f64 {
        self.marks_unanswered
    }
}

impl Default for ScoringRule {
    fn default() -> Self {
        Self::exam_default()
    }
}
