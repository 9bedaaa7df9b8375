//! XP policy for completed attempts.

use serde::{Deserialize, Serialize};

use crate::scoring::ScoreBreakdown;

/// Flat XP for finishing a test.
pub const COMPLETION_XP: u32 = 10;
/// XP per correctly answered question.
pub const XP_PER_CORRECT: u32 = 2;
/// Flat XP when accuracy reaches `ACCURACY_BONUS_THRESHOLD`.
pub const ACCURACY_BONUS_XP: u32 = 5;
/// Accuracy (percent of all questions) that unlocks the bonus.
pub const ACCURACY_BONUS_THRESHOLD: f64 = 75.0;

/// How XP is derived from a score breakdown.
///
/// `Bonus` is the canonical policy. `FinalScore` exists for deployments that
/// configure it explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpPolicy {
    /// Completion bonus + per-correct bonus + accuracy bonus.
    #[default]
    Bonus,
    /// XP equals the final marks, rounded down and floored at zero.
    FinalScore,
}

impl XpPolicy {
    #[must_use]
    pub fn xp_for(self, breakdown: &ScoreBreakdown) -> u32 {
        match self {
            XpPolicy::Bonus => {
                let accuracy_bonus = if breakdown.accuracy_percent() >= ACCURACY_BONUS_THRESHOLD {
                    ACCURACY_BONUS_XP
                } else {
                    0
                };
                COMPLETION_XP
                    .saturating_add(breakdown.correct.saturating_mul(XP_PER_CORRECT))
                    .saturating_add(accuracy_bonus)
            }
            // The cast only runs once `marks` is known to fit in a u32.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            XpPolicy::FinalScore => {
                let marks = breakdown.total_marks.floor();
                if marks <= 0.0 {
                    0
                } else if marks >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    marks as u32
                }
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            XpPolicy::Bonus => "bonus",
            XpPolicy::FinalScore => "score",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bonus" => Some(Self::Bonus),
            "score" | "final_score" => Some(Self::FinalScore),
            _ => None,
        }
    }
}
