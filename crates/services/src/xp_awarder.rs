//! Exactly-once XP grants for completed attempts.

use std::sync::Arc;

use exam_core::model::{AttemptId, NewXpTransaction, TestId, UserId, XpResult, XpSource, XpTransaction};
use exam_core::{ScoreBreakdown, XpPolicy};
use serde::Serialize;
use storage::repository::{StorageError, XpRepository};
use tracing::info;

use crate::Clock;
use crate::error::XpAwardError;

/// Result of `XpAwarder::award`. A replay is a success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "xp", rename_all = "snake_case")]
pub enum AwardOutcome {
    Awarded(XpResult),
    AlreadyAwarded(XpResult),
}

impl AwardOutcome {
    #[must_use]
    pub fn result(&self) -> XpResult {
        match self {
            AwardOutcome::Awarded(result) | AwardOutcome::AlreadyAwarded(result) => *result,
        }
    }

    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, AwardOutcome::AlreadyAwarded(_))
    }
}

#[derive(Clone)]
pub struct XpAwarder {
    clock: Clock,
    xp: Arc<dyn XpRepository>,
    policy: XpPolicy,
}

impl XpAwarder {
    #[must_use]
    pub fn new(clock: Clock, xp: Arc<dyn XpRepository>, policy: XpPolicy) -> Self {
        Self { clock, xp, policy }
    }

    #[must_use]
    pub fn policy(&self) -> XpPolicy {
        self.policy
    }

    /// Grant XP for a completed attempt, once.
    ///
    /// The transaction row is the idempotency key: a second call for the same
    /// attempt returns the recorded result without touching the profile. A
    /// transaction recorded by an interrupted earlier call is completed here.
    ///
    /// # Errors
    ///
    /// Returns `XpAwardError::Storage` when the grant cannot be recorded.
    #[tracing::instrument(skip_all, fields(%attempt_id, %user_id))]
    pub async fn award(
        &self,
        attempt_id: AttemptId,
        user_id: UserId,
        test_id: TestId,
        breakdown: &ScoreBreakdown,
    ) -> Result<AwardOutcome, XpAwardError> {
        if let Some(existing) = self.xp.find_xp_transaction(attempt_id).await? {
            return self.complete(existing).await;
        }

        let new_tx = NewXpTransaction {
            attempt_id,
            user_id,
            test_id,
            source: XpSource::TestCompleted,
            xp_earned: self.policy.xp_for(breakdown),
            created_at: self.clock.now(),
        };
        let recorded = match self.xp.insert_xp_transaction(&new_tx).await {
            Ok(recorded) => recorded,
            Err(StorageError::Conflict) => self
                .xp
                .find_xp_transaction(attempt_id)
                .await?
                .ok_or(StorageError::Conflict)?,
            Err(err) => return Err(err.into()),
        };

        self.complete(recorded).await
    }

    async fn complete(&self, tx: XpTransaction) -> Result<AwardOutcome, XpAwardError> {
        if let Some(result) = tx.result() {
            info!(xp = result.xp_earned, "xp already awarded");
            return Ok(AwardOutcome::AlreadyAwarded(result));
        }

        let totals = self
            .xp
            .increment_profile_xp(tx.user_id, tx.attempt_id, tx.xp_earned, tx.created_at)
            .await?;
        let result = XpResult {
            xp_earned: tx.xp_earned,
            new_total_xp: totals.total_xp,
            new_weekly_xp: totals.weekly_xp,
        };
        info!(
            xp = result.xp_earned,
            total = result.new_total_xp,
            weekly = result.new_weekly_xp,
            policy = self.policy.as_str(),
            "xp awarded"
        );
        Ok(AwardOutcome::Awarded(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::time::fixed_now;
    use storage::repository::InMemoryRepository;

    fn breakdown(correct: u32, incorrect: u32, unanswered: u32) -> ScoreBreakdown {
        ScoreBreakdown {
            correct,
            incorrect,
            unanswered,
            correct_marks: f64::from(correct),
            total_marks: f64::from(correct),
            max_possible_marks: f64::from(correct + incorrect + unanswered),
            ..ScoreBreakdown::default()
        }
    }

    fn awarder(repo: &InMemoryRepository, policy: XpPolicy) -> XpAwarder {
        XpAwarder::new(Clock::fixed(fixed_now()), Arc::new(repo.clone()), policy)
    }

    #[tokio::test]
    async fn second_award_is_a_replay() {
        let repo = InMemoryRepository::new();
        let xp = awarder(&repo, XpPolicy::Bonus);
        let user = UserId::random();
        let score = breakdown(8, 2, 0);

        let first = xp
            .award(AttemptId::new(1), user, TestId::new(1), &score)
            .await
            .unwrap();
        let second = xp
            .award(AttemptId::new(1), user, TestId::new(1), &score)
            .await
            .unwrap();

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.result(), second.result());
        // 10 completion + 8 * 2 + 5 accuracy bonus
        assert_eq!(first.result().xp_earned, 31);
        assert_eq!(repo.get_profile_xp(user).await.unwrap().total_xp, 31);
    }

    #[tokio::test]
    async fn replay_keeps_recorded_amount_under_new_policy() {
        let repo = InMemoryRepository::new();
        let user = UserId::random();
        let score = breakdown(3, 1, 0);

        let bonus = awarder(&repo, XpPolicy::Bonus)
            .award(AttemptId::new(2), user, TestId::new(1), &score)
            .await
            .unwrap();
        let replay = awarder(&repo, XpPolicy::FinalScore)
            .award(AttemptId::new(2), user, TestId::new(1), &score)
            .await
            .unwrap();
        assert_eq!(replay.result().xp_earned, bonus.result().xp_earned);
    }

    #[tokio::test]
    async fn interrupted_grant_is_completed() {
        let repo = InMemoryRepository::new();
        let user = UserId::random();
        repo.insert_xp_transaction(&NewXpTransaction {
            attempt_id: AttemptId::new(3),
            user_id: user,
            test_id: TestId::new(1),
            source: XpSource::TestCompleted,
            xp_earned: 12,
            created_at: fixed_now(),
        })
        .await
        .unwrap();

        let outcome = awarder(&repo, XpPolicy::Bonus)
            .award(AttemptId::new(3), user, TestId::new(1), &breakdown(0, 0, 5))
            .await
            .unwrap();
        assert_eq!(outcome, AwardOutcome::Awarded(XpResult {
            xp_earned: 12,
            new_total_xp: 12,
            new_weekly_xp: 12,
        }));
    }

    #[tokio::test]
    async fn score_policy_floors_negative_marks() {
        let repo = InMemoryRepository::new();
        let mut score = breakdown(0, 4, 0);
        score.total_marks = -2.0;
        let outcome = awarder(&repo, XpPolicy::FinalScore)
            .award(AttemptId::new(4), UserId::random(), TestId::new(1), &score)
            .await
            .unwrap();
        assert_eq!(outcome.result().xp_earned, 0);
    }
}
