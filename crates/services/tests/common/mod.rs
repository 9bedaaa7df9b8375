#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_core::model::{
    AnswerRecord, Attempt, AttemptId, AttemptStatus, ExamId, NewXpTransaction, OptionId,
    ProfileXp, QuestionDraft, QuestionId, ScoringRule, Test, TestId, UserId, XpTransaction,
};
use storage::repository::{
    AttemptRepository, InMemoryRepository, StatusUpdate, Storage, StorageError, TestRepository,
    XpRepository,
};
use tokio::sync::Barrier;

pub fn exam() -> ExamId {
    ExamId::new(1)
}

pub fn q(id: u64) -> QuestionId {
    QuestionId::new(id)
}

/// Options of question `n` are `n*10+1 ..= n*10+4`; the first one is correct.
pub fn correct(question: u64) -> OptionId {
    OptionId::new(question * 10 + 1)
}

pub fn wrong(question: u64) -> OptionId {
    OptionId::new(question * 10 + 2)
}

pub fn sample_test(id: TestId, questions: u64, duration_minutes: u32) -> Test {
    let questions = (1..=questions)
        .map(|n| {
            let mut draft = QuestionDraft::new(q(n), format!("Question {n}"));
            for k in 1..=4 {
                draft = draft.option(OptionId::new(n * 10 + k), format!("Option {k}"), k == 1);
            }
            draft.validate().unwrap()
        })
        .collect();
    Test::new(id, exam(), "Sample test", duration_minutes, questions).unwrap()
}

pub fn jee_rule() -> ScoringRule {
    ScoringRule::new(4.0, -1.0, 0.0).unwrap()
}

/// Seed `repo` with one test and, optionally, a scoring rule for its exam.
pub async fn seed(repo: &InMemoryRepository, test: &Test, rule: Option<ScoringRule>) {
    repo.upsert_test(test).await.unwrap();
    if let Some(rule) = rule {
        repo.upsert_scoring_rule(test.exam_id(), &rule).await.unwrap();
    }
}

//
// ─── FAULT INJECTION ───────────────────────────────────────────────────────────
//

/// In-memory repository that fails selected writes with a transient error.
#[derive(Clone, Default)]
pub struct FlakyRepository {
    pub inner: InMemoryRepository,
    /// Remaining `write_answers` calls to fail.
    pub answer_failures: Arc<AtomicU32>,
    /// Remaining `insert_xp_transaction` calls to fail.
    pub xp_failures: Arc<AtomicU32>,
    /// Abandon the attempt right after the next successful `write_answers`.
    pub abandon_after_answers: Arc<AtomicBool>,
}

impl FlakyRepository {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_answer_writes(&self, times: u32) {
        self.answer_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_xp_inserts(&self, times: u32) {
        self.xp_failures.store(times, Ordering::SeqCst);
    }

    pub fn abandon_after_answer_write(&self) {
        self.abandon_after_answers.store(true, Ordering::SeqCst);
    }

    pub fn storage(&self) -> Storage {
        Storage::from_repo(self.clone())
    }
}

fn take_failure(counter: &AtomicU32) -> Result<(), StorageError> {
    let took = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if took {
        Err(StorageError::Connection("injected failure".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl TestRepository for FlakyRepository {
    async fn get_test(&self, id: TestId) -> Result<Test, StorageError> {
        self.inner.get_test(id).await
    }

    async fn get_scoring_rule(&self, exam_id: ExamId) -> Result<ScoringRule, StorageError> {
        self.inner.get_scoring_rule(exam_id).await
    }

    async fn upsert_test(&self, test: &Test) -> Result<(), StorageError> {
        self.inner.upsert_test(test).await
    }

    async fn upsert_scoring_rule(
        &self,
        exam_id: ExamId,
        rule: &ScoringRule,
    ) -> Result<(), StorageError> {
        self.inner.upsert_scoring_rule(exam_id, rule).await
    }
}

#[async_trait]
impl AttemptRepository for FlakyRepository {
    async fn create_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        started_at: DateTime<Utc>,
    ) -> Result<Attempt, StorageError> {
        self.inner.create_attempt(user_id, test_id, started_at).await
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Attempt, StorageError> {
        self.inner.get_attempt(id).await
    }

    async fn find_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Vec<Attempt>, StorageError> {
        self.inner.find_attempts(user_id, test_id, status).await
    }

    async fn list_in_progress_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Attempt>, StorageError> {
        self.inner.list_in_progress_started_before(cutoff).await
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        update: StatusUpdate,
    ) -> Result<Attempt, StorageError> {
        self.inner.update_attempt_status(id, update).await
    }

    async fn write_answers(
        &self,
        attempt_id: AttemptId,
        answers: &[AnswerRecord],
    ) -> Result<(), StorageError> {
        take_failure(&self.answer_failures)?;
        self.inner.write_answers(attempt_id, answers).await?;
        if self.abandon_after_answers.swap(false, Ordering::SeqCst) {
            self.inner
                .update_attempt_status(attempt_id, StatusUpdate::Abandon)
                .await?;
        }
        Ok(())
    }

    async fn list_answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>, StorageError> {
        self.inner.list_answers(attempt_id).await
    }
}

#[async_trait]
impl XpRepository for FlakyRepository {
    async fn insert_xp_transaction(
        &self,
        tx: &NewXpTransaction,
    ) -> Result<XpTransaction, StorageError> {
        take_failure(&self.xp_failures)?;
        self.inner.insert_xp_transaction(tx).await
    }

    async fn find_xp_transaction(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<XpTransaction>, StorageError> {
        self.inner.find_xp_transaction(attempt_id).await
    }

    async fn increment_profile_xp(
        &self,
        user_id: UserId,
        attempt_id: AttemptId,
        amount: u32,
        at: DateTime<Utc>,
    ) -> Result<ProfileXp, StorageError> {
        self.inner
            .increment_profile_xp(user_id, attempt_id, amount, at)
            .await
    }

    async fn get_profile_xp(&self, user_id: UserId) -> Result<ProfileXp, StorageError> {
        self.inner.get_profile_xp(user_id).await
    }
}

//
// ─── RACE INJECTION ────────────────────────────────────────────────────────────
//

/// Holds the first two `create_attempt` calls until both arrived, so two
/// starters that each saw no active attempt both insert one.
#[derive(Clone)]
pub struct RacingAttempts {
    pub inner: InMemoryRepository,
    barrier: Arc<Barrier>,
    released: Arc<AtomicBool>,
    creates: Arc<AtomicU32>,
}

impl RacingAttempts {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(2)),
            released: Arc::new(AtomicBool::new(false)),
            creates: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn storage(&self) -> Storage {
        Storage {
            tests: Arc::new(self.inner.clone()),
            attempts: Arc::new(self.clone()),
            xp: Arc::new(self.inner.clone()),
        }
    }
}

#[async_trait]
impl AttemptRepository for RacingAttempts {
    async fn create_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        started_at: DateTime<Utc>,
    ) -> Result<Attempt, StorageError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.released.load(Ordering::SeqCst) {
            self.barrier.wait().await;
            self.released.store(true, Ordering::SeqCst);
        }
        self.inner.create_attempt(user_id, test_id, started_at).await
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Attempt, StorageError> {
        self.inner.get_attempt(id).await
    }

    async fn find_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Vec<Attempt>, StorageError> {
        self.inner.find_attempts(user_id, test_id, status).await
    }

    async fn list_in_progress_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Attempt>, StorageError> {
        self.inner.list_in_progress_started_before(cutoff).await
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        update: StatusUpdate,
    ) -> Result<Attempt, StorageError> {
        self.inner.update_attempt_status(id, update).await
    }

    async fn write_answers(
        &self,
        attempt_id: AttemptId,
        answers: &[AnswerRecord],
    ) -> Result<(), StorageError> {
        self.inner.write_answers(attempt_id, answers).await
    }

    async fn list_answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>, StorageError> {
        self.inner.list_answers(attempt_id).await
    }
}

/// Holds the first two `find_xp_transaction` calls until both have looked,
/// so two awarders that each saw no transaction both try to insert one.
#[derive(Clone)]
pub struct RacingXp {
    pub inner: InMemoryRepository,
    barrier: Arc<Barrier>,
    finds: Arc<AtomicU32>,
    inserts: Arc<AtomicU32>,
}

impl RacingXp {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(2)),
            finds: Arc::new(AtomicU32::new(0)),
            inserts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn inserts(&self) -> u32 {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XpRepository for RacingXp {
    async fn insert_xp_transaction(
        &self,
        tx: &NewXpTransaction,
    ) -> Result<XpTransaction, StorageError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_xp_transaction(tx).await
    }

    async fn find_xp_transaction(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<XpTransaction>, StorageError> {
        let found = self.inner.find_xp_transaction(attempt_id).await?;
        if self.finds.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        Ok(found)
    }

    async fn increment_profile_xp(
        &self,
        user_id: UserId,
        attempt_id: AttemptId,
        amount: u32,
        at: DateTime<Utc>,
    ) -> Result<ProfileXp, StorageError> {
        self.inner
            .increment_profile_xp(user_id, attempt_id, amount, at)
            .await
    }

    async fn get_profile_xp(&self, user_id: UserId) -> Result<ProfileXp, StorageError> {
        self.inner.get_profile_xp(user_id).await
    }
}
