use std::fmt;

use exam_core::ScoreBreakdown;
use exam_core::model::{AttemptId, EndedBy, XpResult};
use serde::Serialize;

/// Orchestrator lifecycle. `Submitting` doubles as the double-submit guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    NotStarted,
    Active,
    Submitting,
    Completed,
    Abandoned,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NotStarted => "not_started",
            SessionState::Active => "active",
            SessionState::Submitting => "submitting",
            SessionState::Completed => "completed",
            SessionState::Abandoned => "abandoned",
        }
    }

    /// States from which a new attempt may be started.
    #[must_use]
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::NotStarted | SessionState::Abandoned)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the presentation layer shows after a completed submission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub attempt_id: AttemptId,
    pub ended_by: EndedBy,
    pub breakdown: ScoreBreakdown,
    pub xp: XpResult,
    /// The XP grant had already been recorded by an earlier run.
    pub xp_replayed: bool,
}

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub attempt_id: Option<AttemptId>,
    pub remaining_secs: u64,
    pub answered: usize,
    pub total_questions: usize,
    pub result: Option<SessionOutcome>,
    pub last_error: Option<String>,
}
