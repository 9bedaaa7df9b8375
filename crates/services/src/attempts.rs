//! Attempt lifecycle: creation with duplicate reconciliation, resume,
//! abandonment, finalization and stale cleanup.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use exam_core::model::{Attempt, AttemptId, AttemptStatus, EndedBy, TestId, UserId};
use storage::repository::{AttemptRepository, StatusUpdate, StorageError};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::Clock;
use crate::error::AttemptManagerError;

/// Owns every status change of attempts for the session core.
#[derive(Clone)]
pub struct AttemptManager {
    clock: Clock,
    attempts: Arc<dyn AttemptRepository>,
    resume_prompt_after: Duration,
}

impl AttemptManager {
    #[must_use]
    pub fn new(clock: Clock, attempts: Arc<dyn AttemptRepository>) -> Self {
        Self {
            clock,
            attempts,
            resume_prompt_after: Duration::hours(2),
        }
    }

    #[must_use]
    pub fn with_resume_prompt_after(mut self, after: Duration) -> Self {
        self.resume_prompt_after = after;
        self
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Return the active attempt for (user, test), creating one if needed.
    ///
    /// Concurrent callers converge on the first-created attempt; any other
    /// in-progress attempt found afterwards is abandoned.
    ///
    /// # Errors
    ///
    /// Returns `AttemptManagerError::ConflictingAttempt` if creation was
    /// rejected and no active attempt could be found afterwards, or a storage error.
    #[tracing::instrument(skip_all, fields(%user_id, %test_id))]
    pub async fn start(
        &self,
        user_id: UserId,
        test_id: TestId,
    ) -> Result<Attempt, AttemptManagerError> {
        let active = self.active_attempts(user_id, test_id).await?;
        if !active.is_empty() {
            return self.settle(active).await;
        }

        match self
            .attempts
            .create_attempt(user_id, test_id, self.clock.now())
            .await
        {
            Ok(created) => info!(attempt_id = %created.id(), "attempt created"),
            Err(StorageError::Conflict) => debug!("attempt creation lost a race"),
            Err(err) => return Err(err.into()),
        }

        let active = self.active_attempts(user_id, test_id).await?;
        self.settle(active).await
    }

    async fn active_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
    ) -> Result<Vec<Attempt>, AttemptManagerError> {
        Ok(self
            .attempts
            .find_attempts(user_id, test_id, AttemptStatus::InProgress)
            .await?)
    }

    /// Keep the first-created of `active` and abandon the rest.
    async fn settle(&self, active: Vec<Attempt>) -> Result<Attempt, AttemptManagerError> {
        let mut active = active.into_iter();
        let survivor = active.next().ok_or(AttemptManagerError::ConflictingAttempt)?;

        for duplicate in active {
            match self
                .attempts
                .update_attempt_status(duplicate.id(), StatusUpdate::Abandon)
                .await
            {
                Ok(_) | Err(StorageError::Conflict | StorageError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
            warn!(
                kept = %survivor.id(),
                abandoned = %duplicate.id(),
                "abandoned duplicate in-progress attempt"
            );
        }

        Ok(survivor)
    }

    /// The in-progress attempt for (user, test), if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn find_active(
        &self,
        user_id: UserId,
        test_id: TestId,
    ) -> Result<Option<Attempt>, AttemptManagerError> {
        Ok(self
            .attempts
            .find_attempt(user_id, test_id, AttemptStatus::InProgress)
            .await?)
    }

    /// Load an attempt for continued answering.
    ///
    /// # Errors
    ///
    /// Returns `AttemptManagerError::NotFound` unless the attempt exists and is in progress.
    pub async fn resume(&self, attempt_id: AttemptId) -> Result<Attempt, AttemptManagerError> {
        match self.attempts.get_attempt(attempt_id).await {
            Ok(attempt) if attempt.is_in_progress() => Ok(attempt),
            Ok(_) | Err(StorageError::NotFound) => Err(AttemptManagerError::NotFound(attempt_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Abandon an in-progress attempt. Returns `false` when it had already ended.
    ///
    /// # Errors
    ///
    /// Returns `AttemptManagerError::NotFound` for unknown attempts.
    #[tracing::instrument(skip_all, fields(%attempt_id))]
    pub async fn abandon(&self, attempt_id: AttemptId) -> Result<bool, AttemptManagerError> {
        match self
            .attempts
            .update_attempt_status(attempt_id, StatusUpdate::Abandon)
            .await
        {
            Ok(_) => {
                info!("attempt abandoned");
                Ok(true)
            }
            Err(StorageError::Conflict) => Ok(false),
            Err(StorageError::NotFound) => Err(AttemptManagerError::NotFound(attempt_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Complete an in-progress attempt with its final score, ending it now.
    ///
    /// # Errors
    ///
    /// Returns `AttemptManagerError::InvalidTransition` if the attempt is no
    /// longer in progress, or `NotFound` for unknown attempts.
    #[tracing::instrument(skip_all, fields(%attempt_id, ended_by = ended_by.as_str()))]
    pub async fn finalize(
        &self,
        attempt_id: AttemptId,
        ended_by: EndedBy,
        score: f64,
    ) -> Result<Attempt, AttemptManagerError> {
        let update = StatusUpdate::Complete {
            ended_at: self.clock.now(),
            ended_by,
            score,
        };
        match self.attempts.update_attempt_status(attempt_id, update).await {
            Ok(done) => {
                info!(score, "attempt finalized");
                Ok(done)
            }
            Err(StorageError::NotFound) => Err(AttemptManagerError::NotFound(attempt_id)),
            Err(StorageError::Conflict) => {
                let current = self.attempts.get_attempt(attempt_id).await?;
                Err(AttemptManagerError::InvalidTransition {
                    attempt: attempt_id,
                    from: current.status(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Abandon the active attempt for (user, test), if any, and start afresh.
    ///
    /// # Errors
    ///
    /// Returns the same errors as `abandon` and `start`.
    pub async fn force_abandon_and_restart(
        &self,
        user_id: UserId,
        test_id: TestId,
    ) -> Result<Attempt, AttemptManagerError> {
        for attempt in self.active_attempts(user_id, test_id).await? {
            self.abandon(attempt.id()).await?;
        }
        self.start(user_id, test_id).await
    }

    #[must_use]
    pub fn age(&self, attempt: &Attempt) -> Duration {
        attempt.age(self.clock.now())
    }

    /// Whether an unfinished attempt is old enough to offer resume-or-restart.
    #[must_use]
    pub fn needs_resume_prompt(&self, attempt: &Attempt) -> bool {
        attempt.is_in_progress() && attempt.is_older_than(self.clock.now(), self.resume_prompt_after)
    }

    /// Abandon every in-progress attempt started more than `threshold` ago.
    ///
    /// # Errors
    ///
    /// Returns a storage error if listing or updating fails.
    #[tracing::instrument(skip_all)]
    pub async fn cleanup_stale(
        &self,
        threshold: Duration,
    ) -> Result<Vec<AttemptId>, AttemptManagerError> {
        let cutoff = self.clock.now() - threshold;
        let stale = self.attempts.list_in_progress_started_before(cutoff).await?;

        let mut abandoned = Vec::with_capacity(stale.len());
        for attempt in stale {
            match self
                .attempts
                .update_attempt_status(attempt.id(), StatusUpdate::Abandon)
                .await
            {
                Ok(_) => abandoned.push(attempt.id()),
                Err(StorageError::Conflict | StorageError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if !abandoned.is_empty() {
            info!(count = abandoned.len(), %cutoff, "abandoned stale attempts");
        }
        Ok(abandoned)
    }

    /// Run `cleanup_stale` every `every` until `shutdown` flips.
    pub async fn run_cleanup_loop(
        self,
        every: StdDuration,
        threshold: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.cleanup_stale(threshold).await {
                        tracing::error!(error = %err, "stale attempt cleanup failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::time::fixed_now;
    use storage::repository::InMemoryRepository;

    fn manager(repo: &InMemoryRepository) -> AttemptManager {
        AttemptManager::new(Clock::fixed(fixed_now()), Arc::new(repo.clone()))
    }

    #[tokio::test]
    async fn start_reuses_active_attempt() {
        let repo = InMemoryRepository::new();
        let mgr = manager(&repo);
        let user = UserId::random();

        let first = mgr.start(user, TestId::new(1)).await.unwrap();
        let second = mgr.start(user, TestId::new(1)).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.started_at(), fixed_now());
    }

    #[tokio::test]
    async fn start_keeps_earliest_and_abandons_duplicates() {
        let repo = InMemoryRepository::new();
        let user = UserId::random();
        let older = repo
            .create_attempt(user, TestId::new(1), fixed_now() - Duration::minutes(5))
            .await
            .unwrap();
        let newer = repo
            .create_attempt(user, TestId::new(1), fixed_now())
            .await
            .unwrap();

        let kept = manager(&repo).start(user, TestId::new(1)).await.unwrap();
        assert_eq!(kept.id(), older.id());
        let newer = repo.get_attempt(newer.id()).await.unwrap();
        assert_eq!(newer.status(), AttemptStatus::Abandoned);
    }

    #[tokio::test]
    async fn settled_attempt_survives_a_late_insert_with_an_earlier_clock() {
        let repo = InMemoryRepository::new();
        let user = UserId::random();
        let ahead = AttemptManager::new(
            Clock::fixed(fixed_now() + Duration::seconds(1)),
            Arc::new(repo.clone()),
        );

        let handed_out = ahead.start(user, TestId::new(1)).await.unwrap();
        // a second starter, whose clock lags, inserts after the first settled
        let late = repo
            .create_attempt(user, TestId::new(1), fixed_now())
            .await
            .unwrap();
        assert!(late.started_at() < handed_out.started_at());

        let kept = manager(&repo).start(user, TestId::new(1)).await.unwrap();
        assert_eq!(kept.id(), handed_out.id());
        assert!(repo.get_attempt(handed_out.id()).await.unwrap().is_in_progress());
        assert_eq!(
            repo.get_attempt(late.id()).await.unwrap().status(),
            AttemptStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn start_recovers_from_unique_conflict() {
        let repo = InMemoryRepository::new().with_unique_active_attempts();
        let user = UserId::random();
        let existing = repo
            .create_attempt(user, TestId::new(1), fixed_now())
            .await
            .unwrap();

        let attempt = manager(&repo).start(user, TestId::new(1)).await.unwrap();
        assert_eq!(attempt.id(), existing.id());
    }

    #[tokio::test]
    async fn resume_requires_in_progress() {
        let repo = InMemoryRepository::new();
        let mgr = manager(&repo);
        let attempt = mgr.start(UserId::random(), TestId::new(1)).await.unwrap();
        assert_eq!(mgr.resume(attempt.id()).await.unwrap().id(), attempt.id());

        mgr.finalize(attempt.id(), EndedBy::User, 1.0).await.unwrap();
        assert!(matches!(
            mgr.resume(attempt.id()).await,
            Err(AttemptManagerError::NotFound(_))
        ));
        assert!(matches!(
            mgr.resume(AttemptId::new(404)).await,
            Err(AttemptManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn abandon_is_idempotent_and_finalize_is_strict() {
        let repo = InMemoryRepository::new();
        let mgr = manager(&repo);
        let attempt = mgr.start(UserId::random(), TestId::new(1)).await.unwrap();

        assert!(mgr.abandon(attempt.id()).await.unwrap());
        assert!(!mgr.abandon(attempt.id()).await.unwrap());

        let stored = repo.get_attempt(attempt.id()).await.unwrap();
        assert_eq!(stored.status(), AttemptStatus::Abandoned);
        assert_eq!(stored.ended_at(), None);

        let err = mgr
            .finalize(attempt.id(), EndedBy::Timeout, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttemptManagerError::InvalidTransition {
                from: AttemptStatus::Abandoned,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn force_restart_replaces_active_attempt() {
        let repo = InMemoryRepository::new();
        let mgr = manager(&repo);
        let user = UserId::random();
        let old = mgr.start(user, TestId::new(1)).await.unwrap();

        let fresh = mgr.force_abandon_and_restart(user, TestId::new(1)).await.unwrap();
        assert_ne!(fresh.id(), old.id());
        assert_eq!(
            repo.get_attempt(old.id()).await.unwrap().status(),
            AttemptStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn stale_attempts_are_cleaned_up() {
        let repo = InMemoryRepository::new();
        let mgr = manager(&repo);
        let stale = repo
            .create_attempt(UserId::random(), TestId::new(1), fixed_now() - Duration::hours(25))
            .await
            .unwrap();
        let recent = repo
            .create_attempt(UserId::random(), TestId::new(1), fixed_now() - Duration::hours(3))
            .await
            .unwrap();

        assert!(mgr.needs_resume_prompt(&recent));
        assert_eq!(mgr.age(&recent), Duration::hours(3));

        let abandoned = mgr.cleanup_stale(Duration::hours(24)).await.unwrap();
        assert_eq!(abandoned, vec![stale.id()]);
        assert!(repo.get_attempt(recent.id()).await.unwrap().is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_loop_stops_on_shutdown() {
        let repo = InMemoryRepository::new();
        let stale = repo
            .create_attempt(UserId::random(), TestId::new(1), fixed_now() - Duration::hours(30))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(manager(&repo).run_cleanup_loop(
            StdDuration::from_secs(60),
            Duration::hours(24),
            rx,
        ));

        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert_eq!(
            repo.get_attempt(stale.id()).await.unwrap().status(),
            AttemptStatus::Abandoned
        );
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
