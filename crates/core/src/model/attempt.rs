use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{AttemptId, TestId, UserId};

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("attempt cannot move from {from} to {to}")]
    InvalidTransition {
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("end time is before start time")]
    InvalidTimeRange,

    #[error("unknown attempt status: {0}")]
    UnknownStatus(String),

    #[error("unknown end reason: {0}")]
    UnknownEndReason(String),
}

//
// ─── STATUS ───────────────────────────────────────────────────────────────────
//

/// Lifecycle of an attempt: `pending → in_progress → completed | abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Completed,
    Abandoned,
}

impl AttemptStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Abandoned)
    }

    #[must_use]
    pub fn can_transition_to(self, next: AttemptStatus) -> bool {
        matches!(
            (self, next),
            (AttemptStatus::Pending, AttemptStatus::InProgress)
                | (AttemptStatus::Pending, AttemptStatus::Abandoned)
                | (AttemptStatus::InProgress, AttemptStatus::Completed)
                | (AttemptStatus::InProgress, AttemptStatus::Abandoned)
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = AttemptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(AttemptError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Who ended a completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedBy {
    User,
    Timeout,
    System,
}

impl EndedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EndedBy::User => "user",
            EndedBy::Timeout => "timeout",
            EndedBy::System => "system",
        }
    }
}

impl fmt::Display for EndedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndedBy {
    type Err = AttemptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "timeout" => Ok(Self::Timeout),
            "system" => Ok(Self::System),
            other => Err(AttemptError::UnknownEndReason(other.to_owned())),
        }
    }
}

//
// ─── ATTEMPT ──────────────────────────────────────────────────────────────────
//

/// One user's run through one test.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    id: AttemptId,
    user_id: UserId,
    test_id: TestId,
    status: AttemptStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    ended_by: Option<EndedBy>,
    score: Option<f64>,
}

impl Attempt {
    /// A freshly created attempt, already in progress.
    #[must_use]
    pub fn start(id: AttemptId, user_id: UserId, test_id: TestId, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            test_id,
            status: AttemptStatus::InProgress,
            started_at,
            ended_at: None,
            ended_by: None,
            score: None,
        }
    }

    /// Rehydrate an attempt from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTimeRange` if `ended_at` precedes `started_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: AttemptId,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        ended_by: Option<EndedBy>,
        score: Option<f64>,
    ) -> Result<Self, AttemptError> {
        if ended_at.is_some_and(|end| end < started_at) {
            return Err(AttemptError::InvalidTimeRange);
        }
        Ok(Self {
            id,
            user_id,
            test_id,
            status,
            started_at,
            ended_at,
            ended_by,
            score,
        })
    }

    #[must_use]
    pub fn id(&self) -> AttemptId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn test_id(&self) -> TestId {
        self.test_id
    }

    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    #[must_use]
    pub fn ended_by(&self) -> Option<EndedBy> {
        self.ended_by
    }

    #[must_use]
    pub fn score(&self) -> Option<f64> {
        self.score
    }

    /// Time since the attempt started, never negative.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).max(Duration::zero())
    }

    #[must_use]
    pub fn is_older_than(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) >= threshold
    }

    /// Ordering key for reconciling duplicates.
    ///
    /// Storage assigns ids in insert order; `started_at` comes from the
    /// caller's clock and may be skewed, so it plays no part here.
    #[must_use]
    pub fn creation_key(&self) -> AttemptId {
        self.id
    }

    /// Move `in_progress → completed`, fixing end time, reason and score.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` if the attempt is not in progress,
    /// or `InvalidTimeRange` if `ended_at` precedes the start.
    pub fn complete(
        &mut self,
        ended_at: DateTime<Utc>,
        ended_by: EndedBy,
        score: f64,
    ) -> Result<(), AttemptError> {
        self.ensure_transition(AttemptStatus::Completed)?;
        if ended_at < self.started_at {
            return Err(AttemptError::InvalidTimeRange);
        }
        self.status = AttemptStatus::Completed;
        self.ended_at = Some(ended_at);
        self.ended_by = Some(ended_by);
        self.score = Some(score);
        Ok(())
    }

    /// Move to `abandoned`. End time stays unset; it is reserved for completion.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` if the attempt already ended.
    pub fn abandon(&mut self) -> Result<(), AttemptError> {
        self.ensure_transition(AttemptStatus::Abandoned)?;
        self.status = AttemptStatus::Abandoned;
        Ok(())
    }

    fn ensure_transition(&self, to: AttemptStatus) -> Result<(), AttemptError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(AttemptError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn attempt() -> Attempt {
        Attempt::start(AttemptId::new(1), UserId::random(), TestId::new(2), fixed_now())
    }

    #[test]
    fn completes_once() {
        let mut a = attempt();
        let end = fixed_now() + Duration::minutes(20);
        a.complete(end, EndedBy::Timeout, 11.0).unwrap();
        assert_eq!(a.status(), AttemptStatus::Completed);
        assert_eq!(a.ended_at(), Some(end));
        assert_eq!(a.ended_by(), Some(EndedBy::Timeout));
        assert_eq!(a.score(), Some(11.0));

        let err = a.complete(end, EndedBy::User, 0.0).unwrap_err();
        assert_eq!(
            err,
            AttemptError::InvalidTransition {
                from: AttemptStatus::Completed,
                to: AttemptStatus::Completed,
            }
        );
    }

    #[test]
    fn abandon_leaves_end_time_unset() {
        let mut a = attempt();
        a.abandon().unwrap();
        assert_eq!(a.status(), AttemptStatus::Abandoned);
        assert_eq!(a.ended_at(), None);
        assert!(a.abandon().is_err());
    }

    #[test]
    fn age_is_clamped_and_compared() {
        let a = attempt();
        assert_eq!(a.age(fixed_now() - Duration::minutes(1)), Duration::zero());
        assert!(a.is_older_than(fixed_now() + Duration::hours(2), Duration::hours(2)));
        assert!(!a.is_older_than(fixed_now() + Duration::minutes(119), Duration::hours(2)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::InProgress,
            AttemptStatus::Completed,
            AttemptStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<AttemptStatus>().unwrap(), status);
        }
        assert!("done".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn rejects_persisted_end_before_start() {
        let err = Attempt::from_persisted(
            AttemptId::new(1),
            UserId::random(),
            TestId::new(1),
            AttemptStatus::Completed,
            fixed_now(),
            Some(fixed_now() - Duration::seconds(1)),
            Some(EndedBy::User),
            Some(1.0),
        )
        .unwrap_err();
        assert_eq!(err, AttemptError::InvalidTimeRange);
    }
}
