use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use exam_core::model::{
    AnswerRecord, Attempt, AttemptId, AttemptStatus, EndedBy, ExamId, NewXpTransaction,
    ProfileXp, QuestionId, ScoringRule, Test, TestId, UserId, XpTransaction,
};
use exam_core::time::week_start;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint or a conditional update rejected the write.
    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

/// Conditional status change applied to an `in_progress` attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusUpdate {
    Complete {
        ended_at: DateTime<Utc>,
        ended_by: EndedBy,
        score: f64,
    },
    Abandon,
}

impl StatusUpdate {
    #[must_use]
    pub fn target(&self) -> AttemptStatus {
        match self {
            StatusUpdate::Complete { .. } => AttemptStatus::Completed,
            StatusUpdate::Abandon => AttemptStatus::Abandoned,
        }
    }
}

/// Read access to tests and scoring rules, plus the writes used by seeding and admin tooling.
#[async_trait]
pub trait TestRepository: Send + Sync {
    /// Fetch a test with its questions and options.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_test(&self, id: TestId) -> Result<Test, StorageError>;

    /// Fetch the scoring rule of an exam.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the exam has no rule.
    async fn get_scoring_rule(&self, exam_id: ExamId) -> Result<ScoringRule, StorageError>;

    /// Persist or replace a test and its questions.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the test cannot be stored.
    async fn upsert_test(&self, test: &Test) -> Result<(), StorageError>;

    /// Persist or replace the scoring rule of an exam.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the rule cannot be stored.
    async fn upsert_scoring_rule(
        &self,
        exam_id: ExamId,
        rule: &ScoringRule,
    ) -> Result<(), StorageError>;
}

/// Attempts and their answers.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Create an `in_progress` attempt.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` when the backend enforces a single
    /// active attempt per (user, test) and one already exists.
    async fn create_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        started_at: DateTime<Utc>,
    ) -> Result<Attempt, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing.
    async fn get_attempt(&self, id: AttemptId) -> Result<Attempt, StorageError>;

    /// All attempts of (user, test) in `status`, earliest created first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn find_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Vec<Attempt>, StorageError>;

    /// Earliest attempt of (user, test) in `status`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn find_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Option<Attempt>, StorageError> {
        Ok(self
            .find_attempts(user_id, test_id, status)
            .await?
            .into_iter()
            .next())
    }

    /// In-progress attempts of any user started before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_in_progress_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Attempt>, StorageError>;

    /// Apply `update` only if the attempt is still `in_progress`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the attempt is missing and
    /// `StorageError::Conflict` if it is no longer in progress.
    async fn update_attempt_status(
        &self,
        id: AttemptId,
        update: StatusUpdate,
    ) -> Result<Attempt, StorageError>;

    /// Upsert answers of an in-progress attempt, keyed by question.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the attempt is no longer in progress.
    async fn write_answers(
        &self,
        attempt_id: AttemptId,
        answers: &[AnswerRecord],
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>, StorageError>;
}

/// XP ledger and profile counters.
#[async_trait]
pub trait XpRepository: Send + Sync {
    /// Record an XP grant.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if a transaction already exists for the attempt.
    async fn insert_xp_transaction(
        &self,
        tx: &NewXpTransaction,
    ) -> Result<XpTransaction, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn find_xp_transaction(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<XpTransaction>, StorageError>;

    /// Atomically add `amount` to the profile counters for the grant of `attempt_id`.
    ///
    /// Applied at most once per attempt; later calls return the counters
    /// recorded when it was first applied.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no transaction exists for the attempt.
    async fn increment_profile_xp(
        &self,
        user_id: UserId,
        attempt_id: AttemptId,
        amount: u32,
        at: DateTime<Utc>,
    ) -> Result<ProfileXp, StorageError>;

    /// Current counters; zero for users that never earned XP.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_profile_xp(&self, user_id: UserId) -> Result<ProfileXp, StorageError>;
}

//
// ─── IN-MEMORY ─────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct AttemptTable {
    next_id: u64,
    rows: BTreeMap<AttemptId, Attempt>,
    answers: HashMap<AttemptId, BTreeMap<QuestionId, AnswerRecord>>,
}

#[derive(Debug, Clone, Copy)]
struct ProfileRow {
    total_xp: u64,
    weekly_xp: u64,
    week_start: NaiveDate,
}

#[derive(Default)]
struct XpTable {
    transactions: HashMap<AttemptId, XpTransaction>,
    profiles: HashMap<UserId, ProfileRow>,
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// Like the hosted data service, it does not enforce a single active attempt
/// per (user, test) unless built with `with_unique_active_attempts`.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    tests: Arc<Mutex<HashMap<TestId, Test>>>,
    rules: Arc<Mutex<HashMap<ExamId, ScoringRule>>>,
    attempts: Arc<Mutex<AttemptTable>>,
    xp: Arc<Mutex<XpTable>>,
    unique_active: bool,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    m.lock().map_err(|e| StorageError::Connection(e.to_string()))
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a second active attempt per (user, test) with `Conflict`,
    /// mirroring a partial unique index.
    #[must_use]
    pub fn with_unique_active_attempts(mut self) -> Self {
        self.unique_active = true;
        self
    }
}

#[async_trait]
impl TestRepository for InMemoryRepository {
    async fn get_test(&self, id: TestId) -> Result<Test, StorageError> {
        let guard = lock(&self.tests)?;
        guard.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn get_scoring_rule(&self, exam_id: ExamId) -> Result<ScoringRule, StorageError> {
        let guard = lock(&self.rules)?;
        guard.get(&exam_id).copied().ok_or(StorageError::NotFound)
    }

    async fn upsert_test(&self, test: &Test) -> Result<(), StorageError> {
        let mut guard = lock(&self.tests)?;
        guard.insert(test.id(), test.clone());
        Ok(())
    }

    async fn upsert_scoring_rule(
        &self,
        exam_id: ExamId,
        rule: &ScoringRule,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.rules)?;
        guard.insert(exam_id, *rule);
        Ok(())
    }
}

#[async_trait]
impl AttemptRepository for InMemoryRepository {
    async fn create_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        started_at: DateTime<Utc>,
    ) -> Result<Attempt, StorageError> {
        let mut guard = lock(&self.attempts)?;
        if self.unique_active
            && guard.rows.values().any(|a| {
                a.user_id() == user_id && a.test_id() == test_id && a.is_in_progress()
            })
        {
            return Err(StorageError::Conflict);
        }
        guard.next_id += 1;
        let attempt = Attempt::start(AttemptId::new(guard.next_id), user_id, test_id, started_at);
        guard.rows.insert(attempt.id(), attempt.clone());
        Ok(attempt)
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Attempt, StorageError> {
        let guard = lock(&self.attempts)?;
        guard.rows.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn find_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Vec<Attempt>, StorageError> {
        let guard = lock(&self.attempts)?;
        let mut found: Vec<Attempt> = guard
            .rows
            .values()
            .filter(|a| a.user_id() == user_id && a.test_id() == test_id && a.status() == status)
            .cloned()
            .collect();
        found.sort_by_key(Attempt::creation_key);
        Ok(found)
    }

    async fn list_in_progress_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Attempt>, StorageError> {
        let guard = lock(&self.attempts)?;
        let mut found: Vec<Attempt> = guard
            .rows
            .values()
            .filter(|a| a.is_in_progress() && a.started_at() < cutoff)
            .cloned()
            .collect();
        found.sort_by_key(Attempt::creation_key);
        Ok(found)
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        update: StatusUpdate,
    ) -> Result<Attempt, StorageError> {
        let mut guard = lock(&self.attempts)?;
        let attempt = guard.rows.get_mut(&id).ok_or(StorageError::NotFound)?;
        if !attempt.is_in_progress() {
            return Err(StorageError::Conflict);
        }
        let applied = match update {
            StatusUpdate::Complete {
                ended_at,
                ended_by,
                score,
            } => attempt.complete(ended_at, ended_by, score),
            StatusUpdate::Abandon => attempt.abandon(),
        };
        applied.map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(attempt.clone())
    }

    async fn write_answers(
        &self,
        attempt_id: AttemptId,
        answers: &[AnswerRecord],
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.attempts)?;
        let attempt = guard.rows.get(&attempt_id).ok_or(StorageError::NotFound)?;
        if !attempt.is_in_progress() {
            return Err(StorageError::Conflict);
        }
        let stored = guard.answers.entry(attempt_id).or_default();
        for record in answers {
            stored.insert(record.question_id, *record);
        }
        Ok(())
    }

    async fn list_answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>, StorageError> {
        let guard = lock(&self.attempts)?;
        Ok(guard
            .answers
            .get(&attempt_id)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl XpRepository for InMemoryRepository {
    async fn insert_xp_transaction(
        &self,
        tx: &NewXpTransaction,
    ) -> Result<XpTransaction, StorageError> {
        let mut guard = lock(&self.xp)?;
        if guard.transactions.contains_key(&tx.attempt_id) {
            return Err(StorageError::Conflict);
        }
        let record = XpTransaction::from_new(tx);
        guard.transactions.insert(tx.attempt_id, record);
        Ok(record)
    }

    async fn find_xp_transaction(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<XpTransaction>, StorageError> {
        let guard = lock(&self.xp)?;
        Ok(guard.transactions.get(&attempt_id).copied())
    }

    async fn increment_profile_xp(
        &self,
        user_id: UserId,
        attempt_id: AttemptId,
        amount: u32,
        at: DateTime<Utc>,
    ) -> Result<ProfileXp, StorageError> {
        let mut guard = lock(&self.xp)?;
        let table = &mut *guard;
        let tx = table
            .transactions
            .get_mut(&attempt_id)
            .ok_or(StorageError::NotFound)?;
        if let Some(totals) = tx.applied {
            return Ok(totals);
        }

        let week = week_start(at);
        let row = table.profiles.entry(user_id).or_insert(ProfileRow {
            total_xp: 0,
            weekly_xp: 0,
            week_start: week,
        });
        if row.week_start != week {
            row.week_start = week;
            row.weekly_xp = 0;
        }
        row.total_xp = row.total_xp.saturating_add(u64::from(amount));
        row.weekly_xp = row.weekly_xp.saturating_add(u64::from(amount));

        let totals = ProfileXp {
            total_xp: row.total_xp,
            weekly_xp: row.weekly_xp,
        };
        tx.applied = Some(totals);
        Ok(totals)
    }

    async fn get_profile_xp(&self, user_id: UserId) -> Result<ProfileXp, StorageError> {
        let guard = lock(&self.xp)?;
        Ok(guard
            .profiles
            .get(&user_id)
            .map(|row| ProfileXp {
                total_xp: row.total_xp,
                weekly_xp: row.weekly_xp,
            })
            .unwrap_or_default())
    }
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub tests: Arc<dyn TestRepository>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub xp: Arc<dyn XpRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_repo(InMemoryRepository::new())
    }

    /// Use one repository value for every concern.
    #[must_use]
    pub fn from_repo<R>(repo: R) -> Self
    where
        R: TestRepository + AttemptRepository + XpRepository + Clone + 'static,
    {
        let tests: Arc<dyn TestRepository> = Arc::new(repo.clone());
        let attempts: Arc<dyn AttemptRepository> = Arc::new(repo.clone());
        let xp: Arc<dyn XpRepository> = Arc::new(repo);
        Self {
            tests,
            attempts,
            xp,
        }
    }
}
