use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use exam_core::AnswerLedger;
use exam_core::model::{
    AnswerRecord, Attempt, AttemptId, AttemptStatus, EndedBy, OptionId, QuestionId, ScoringRule,
    Test, TestId, UserId,
};
use storage::repository::{AttemptRepository, Storage, StorageError, TestRepository};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::recovery::{PendingSubmission, RecoveryQueue};
use super::retry::with_retry;
use super::state::{SessionOutcome, SessionSnapshot, SessionState};
use super::submission::{self, SubmitDeps};
use crate::Clock;
use crate::attempts::AttemptManager;
use crate::config::{AnswerPersistence, SessionConfig};
use crate::error::{Missing, SessionError};
use crate::timer::{TimerController, TimerEvent};
use crate::xp_awarder::XpAwarder;

//
// ─── CORE STATE ────────────────────────────────────────────────────────────────
//

struct SessionCore {
    state: SessionState,
    /// An activation (`start`, `resume`, `replay`) is loading.
    activating: bool,
    /// A submission pipeline is running.
    submitting: bool,
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
    attempt: Option<Attempt>,
    test: Option<Arc<Test>>,
    rule: ScoringRule,
    ledger: Option<AnswerLedger>,
    remaining_secs: u64,
    result: Option<SessionOutcome>,
    last_error: Option<String>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            state: SessionState::NotStarted,
            activating: false,
            submitting: false,
            generation: 0,
            cancel: None,
            attempt: None,
            test: None,
            rule: ScoringRule::exam_default(),
            ledger: None,
            remaining_secs: 0,
            result: None,
            last_error: None,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            attempt_id: self.attempt.as_ref().map(Attempt::id),
            remaining_secs: self.remaining_secs,
            answered: self.ledger.as_ref().map_or(0, AnswerLedger::answered_count),
            total_questions: self.test.as_ref().map_or(0, |t| t.question_count()),
            result: self.result,
            last_error: self.last_error.clone(),
        }
    }

    fn require(&self, operation: &'static str, state: SessionState) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn attempt_id(&self, operation: &'static str) -> Result<AttemptId, SessionError> {
        self.attempt
            .as_ref()
            .map(Attempt::id)
            .ok_or(SessionError::InvalidState {
                operation,
                state: self.state,
            })
    }

    fn loaded_test(&self, operation: &'static str) -> Result<Arc<Test>, SessionError> {
        self.test.clone().ok_or(SessionError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Start a new generation, cancelling whatever the previous one had in flight.
    fn next_generation(&mut self) -> (u64, watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(previous) = self.cancel.replace(cancel_tx) {
            let _ = previous.send(true);
        }
        self.generation += 1;
        (self.generation, cancel_rx)
    }

    fn cancel_in_flight(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

struct Loaded {
    test: Arc<Test>,
    rule: ScoringRule,
    attempt: Attempt,
    ledger: AnswerLedger,
}

struct Shared {
    user_id: UserId,
    test_id: TestId,
    clock: Clock,
    config: SessionConfig,
    tests: Arc<dyn TestRepository>,
    submit: SubmitDeps,
    recovery: RecoveryQueue,
    timer: TimerController,
    core: Mutex<SessionCore>,
    snapshot: watch::Sender<SessionSnapshot>,
}

//
// ─── ORCHESTRATOR ──────────────────────────────────────────────────────────────
//

/// Runs one user's session on one test: start or resume, answer, submit, abandon.
///
/// Clones share the same session. State transitions are serialized; a second
/// `submit` while one is in flight (including the timer's expiry) is a no-op.
#[derive(Clone)]
pub struct SessionOrchestrator {
    shared: Arc<Shared>,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        user_id: UserId,
        test_id: TestId,
        storage: &Storage,
        clock: Clock,
        config: SessionConfig,
        recovery: RecoveryQueue,
    ) -> Self {
        let manager = AttemptManager::new(clock, Arc::clone(&storage.attempts))
            .with_resume_prompt_after(config.resume_prompt_after);
        let awarder = XpAwarder::new(clock, Arc::clone(&storage.xp), config.xp_policy);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        Self {
            shared: Arc::new(Shared {
                user_id,
                test_id,
                clock,
                config,
                tests: Arc::clone(&storage.tests),
                submit: SubmitDeps {
                    attempts: Arc::clone(&storage.attempts),
                    manager,
                    awarder,
                    retry: config.retry,
                },
                recovery,
                timer: TimerController::new(),
                core: Mutex::new(SessionCore::new()),
                snapshot,
            }),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    #[must_use]
    pub fn test_id(&self) -> TestId {
        self.shared.test_id
    }

    #[must_use]
    pub fn attempts(&self) -> &AttemptManager {
        &self.shared.submit.manager
    }

    /// Receive a snapshot on every state, answer or tick change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.snapshot.borrow().state
    }

    /// The queued submission of the current attempt, if its submit has not finished.
    #[must_use]
    pub fn pending_submission(&self) -> Option<PendingSubmission> {
        let attempt_id = self.shared.snapshot.borrow().attempt_id?;
        self.shared.recovery.get(attempt_id)
    }

    fn core(&self) -> Result<MutexGuard<'_, SessionCore>, SessionError> {
        self.shared
            .core
            .lock()
            .map_err(|e| SessionError::Storage(StorageError::Connection(e.to_string())))
    }

    fn publish(&self, core: &SessionCore) {
        self.shared.snapshot.send_replace(core.snapshot());
    }

    //
    // ─── ACTIVATION ────────────────────────────────────────────────────────────
    //

    /// Start the test, or pick up the user's unfinished attempt on it.
    ///
    /// Answers already persisted for a resumed attempt are restored and the
    /// timer continues from the time left.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is not started
    /// or was abandoned; `NotFound`/`NoQuestions` (fatal) for unusable tests;
    /// storage errors otherwise.
    #[tracing::instrument(skip_all, fields(user_id = %self.shared.user_id, test_id = %self.shared.test_id))]
    pub async fn start(&self) -> Result<Attempt, SessionError> {
        self.begin_activation("start")?;
        let loaded: Result<Loaded, SessionError> = async {
            let (test, rule) = self.load_test().await?;
            let attempt = self
                .shared
                .submit
                .manager
                .start(self.shared.user_id, self.shared.test_id)
                .await?;
            let ledger = self.restore_ledger(&test, &attempt).await?;
            Ok(Loaded {
                test,
                rule,
                attempt,
                ledger,
            })
        }
        .await;
        self.activate(loaded)
    }

    /// Continue a specific in-progress attempt of this user on this test.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the attempt is not in progress or
    /// belongs to another user or test, plus the errors of `start`.
    #[tracing::instrument(skip_all, fields(%attempt_id))]
    pub async fn resume(&self, attempt_id: AttemptId) -> Result<Attempt, SessionError> {
        self.begin_activation("resume")?;
        let loaded: Result<Loaded, SessionError> = async {
            let attempt = self.shared.submit.manager.resume(attempt_id).await?;
            if attempt.user_id() != self.shared.user_id || attempt.test_id() != self.shared.test_id
            {
                return Err(SessionError::NotFound(Missing::Attempt(attempt_id)));
            }
            let (test, rule) = self.load_test().await?;
            let ledger = self.restore_ledger(&test, &attempt).await?;
            Ok(Loaded {
                test,
                rule,
                attempt,
                ledger,
            })
        }
        .await;
        self.activate(loaded)
    }

    fn begin_activation(&self, operation: &'static str) -> Result<(), SessionError> {
        let mut core = self.core()?;
        if core.activating || core.submitting || !core.state.can_start() {
            return Err(SessionError::InvalidState {
                operation,
                state: core.state,
            });
        }
        core.activating = true;
        Ok(())
    }

    fn abort_activation(&self, err: SessionError) -> SessionError {
        if let Ok(mut core) = self.core() {
            core.activating = false;
            core.last_error = Some(err.to_string());
            self.publish(&core);
        }
        if err.is_fatal() {
            error!(error = %err, "session cannot start");
        } else {
            warn!(error = %err, "session activation failed");
        }
        err
    }

    fn activate(&self, loaded: Result<Loaded, SessionError>) -> Result<Attempt, SessionError> {
        let loaded = loaded.map_err(|err| self.abort_activation(err))?;
        let remaining_secs = remaining_secs(&loaded.test, &loaded.attempt, self.shared.clock.now());
        let attempt = loaded.attempt.clone();

        let generation = {
            let mut core = self.core()?;
            let (generation, _) = core.next_generation();
            core.state = SessionState::Active;
            core.activating = false;
            core.attempt = Some(loaded.attempt);
            core.test = Some(loaded.test);
            core.rule = loaded.rule;
            core.ledger = Some(loaded.ledger);
            core.remaining_secs = remaining_secs;
            core.result = None;
            core.last_error = None;
            self.publish(&core);
            generation
        };

        let events = self.shared.timer.start(remaining_secs);
        tokio::spawn(self.clone().listen(generation, events));
        info!(attempt_id = %attempt.id(), remaining_secs, "session active");
        Ok(attempt)
    }

    async fn load_test(&self) -> Result<(Arc<Test>, ScoringRule), SessionError> {
        let test_id = self.shared.test_id;
        let test = match self.shared.tests.get_test(test_id).await {
            Ok(test) => test,
            Err(StorageError::NotFound) => return Err(SessionError::NotFound(Missing::Test(test_id))),
            Err(err) => return Err(err.into()),
        };
        if test.questions().is_empty() {
            return Err(SessionError::NoQuestions(test_id));
        }

        let rule = match self.shared.tests.get_scoring_rule(test.exam_id()).await {
            Ok(rule) => rule,
            Err(StorageError::NotFound) => {
                warn!(exam_id = %test.exam_id(), "exam has no scoring rule; using default");
                ScoringRule::exam_default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok((Arc::new(test), rule))
    }

    async fn restore_ledger(&self, test: &Test, attempt: &Attempt) -> Result<AnswerLedger, SessionError> {
        let persisted = self.shared.submit.attempts.list_answers(attempt.id()).await?;
        let restored = persisted
            .into_iter()
            .filter(|r| test.question(r.question_id).is_some_and(|q| q.has_option(r.option_id)))
            .map(|r| (r.question_id, r.option_id));
        let ledger = AnswerLedger::restore(attempt.id(), restored);
        if ledger.answered_count() > 0 {
            debug!(answered = ledger.answered_count(), "restored persisted answers");
        }
        Ok(ledger)
    }

    //
    // ─── ANSWERING ─────────────────────────────────────────────────────────────
    //

    /// Select `option` for `question`, replacing an earlier choice.
    ///
    /// Returns the previous selection. In write-through mode the answer is
    /// also upserted right away; failures there are retried and then left to
    /// the batch write at submit.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless active, or `NotFound` for
    /// questions and options outside the test.
    pub async fn answer(
        &self,
        question: QuestionId,
        option: OptionId,
    ) -> Result<Option<OptionId>, SessionError> {
        let (record, previous) = {
            let mut core = self.core()?;
            core.require("answer", SessionState::Active)?;
            let attempt_id = core.attempt_id("answer")?;
            let test = core.loaded_test("answer")?;
            let q = test
                .question(question)
                .ok_or(SessionError::NotFound(Missing::Question(question)))?;
            if !q.has_option(option) {
                return Err(SessionError::NotFound(Missing::Option { question, option }));
            }

            let state = core.state;
            let ledger = core.ledger.as_mut().ok_or(SessionError::InvalidState {
                operation: "answer",
                state,
            })?;
            let previous = ledger
                .set(question, option)
                .map_err(|_| SessionError::InvalidState {
                    operation: "answer",
                    state,
                })?;
            self.publish(&core);
            (AnswerRecord::for_question(attempt_id, q, option), previous)
        };

        if self.shared.config.answer_persistence == AnswerPersistence::WriteThrough {
            self.write_through(record).await;
        }
        Ok(previous)
    }

    async fn write_through(&self, record: AnswerRecord) {
        let attempts = &self.shared.submit.attempts;
        let written = with_retry(self.shared.config.retry, "write_answer", || {
            attempts.write_answers(record.attempt_id, std::slice::from_ref(&record))
        })
        .await;
        if let Err(err) = written {
            warn!(
                attempt_id = %record.attempt_id,
                question_id = %record.question_id,
                error = %err,
                "write-through answer failed; submit will persist it"
            );
        }
    }

    //
    // ─── SUBMISSION ────────────────────────────────────────────────────────────
    //

    /// Score and finalize the attempt.
    ///
    /// Returns `None` when another submission is already running. Calling it
    /// after completion returns the recorded outcome.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SubmissionFailed` when a storage step keeps
    /// failing; the session stays `Submitting` and `retry_submission` can
    /// replay it. `Cancelled` if the session was closed meanwhile.
    pub async fn submit(&self, ended_by: EndedBy) -> Result<Option<SessionOutcome>, SessionError> {
        self.submit_inner(ended_by, None).await
    }

    #[tracing::instrument(skip_all, fields(ended_by = ended_by.as_str()))]
    async fn submit_inner(
        &self,
        ended_by: EndedBy,
        generation: Option<u64>,
    ) -> Result<Option<SessionOutcome>, SessionError> {
        let (pending, test, rule, mut cancel) = {
            let mut core = self.core()?;
            if generation.is_some_and(|g| g != core.generation) {
                debug!("stale submit ignored");
                return Ok(None);
            }
            match core.state {
                SessionState::Active => {}
                SessionState::Submitting => {
                    debug!("submit ignored; submission already running");
                    return Ok(None);
                }
                SessionState::Completed => return Ok(core.result),
                state => {
                    return Err(SessionError::InvalidState {
                        operation: "submit",
                        state,
                    });
                }
            }

            let attempt_id = core.attempt_id("submit")?;
            let test = core.loaded_test("submit")?;
            let rule = core.rule;
            let cancel = core
                .cancel
                .as_ref()
                .map(watch::Sender::subscribe)
                .ok_or(SessionError::Cancelled)?;
            let answers = core.ledger.as_mut().map(AnswerLedger::seal).unwrap_or_default();

            core.state = SessionState::Submitting;
            core.submitting = true;
            self.publish(&core);

            let pending = PendingSubmission {
                attempt_id,
                user_id: self.shared.user_id,
                test_id: self.shared.test_id,
                answers,
                ended_by,
                queued_at: self.shared.clock.now(),
                retries: 0,
            };
            (pending, test, rule, cancel)
        };

        self.shared.timer.cancel();
        self.shared.recovery.push(pending.clone());
        info!(
            attempt_id = %pending.attempt_id,
            answered = pending.answers.len(),
            "submitting attempt"
        );

        let result = submission::run(&self.shared.submit, &pending, &test, &rule, &mut cancel).await;
        self.finish_submission(&pending, result)
    }

    /// Replay the queued submission of this session after `SubmissionFailed`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is waiting in
    /// `Submitting`, plus the errors of `submit`.
    #[tracing::instrument(skip_all)]
    pub async fn retry_submission(&self) -> Result<Option<SessionOutcome>, SessionError> {
        let (pending, test, rule, mut cancel) = {
            let mut core = self.core()?;
            core.require("retry_submission", SessionState::Submitting)?;
            if core.submitting {
                return Ok(None);
            }
            let attempt_id = core.attempt_id("retry_submission")?;
            let mut pending = self.shared.recovery.get(attempt_id).ok_or(
                SessionError::InvalidState {
                    operation: "retry_submission",
                    state: core.state,
                },
            )?;
            pending.retries += 1;
            let test = core.loaded_test("retry_submission")?;
            let rule = core.rule;
            let (_, cancel) = core.next_generation();
            core.submitting = true;
            core.last_error = None;
            self.publish(&core);
            (pending, test, rule, cancel)
        };

        self.shared.recovery.push(pending.clone());
        info!(attempt_id = %pending.attempt_id, retries = pending.retries, "retrying submission");
        let result = submission::run(&self.shared.submit, &pending, &test, &rule, &mut cancel).await;
        self.finish_submission(&pending, result)
    }

    /// Finish a submission queued by an earlier session, such as one restored
    /// from a persisted `RecoveryQueue` after a restart.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if `pending` belongs to another user
    /// or test, `InvalidState` if this session is busy, plus the errors of `submit`.
    #[tracing::instrument(skip_all, fields(attempt_id = %pending.attempt_id))]
    pub async fn replay(
        &self,
        mut pending: PendingSubmission,
    ) -> Result<Option<SessionOutcome>, SessionError> {
        if pending.user_id != self.shared.user_id || pending.test_id != self.shared.test_id {
            return Err(SessionError::NotFound(Missing::Attempt(pending.attempt_id)));
        }
        self.begin_activation("replay")?;

        let loaded: Result<(Arc<Test>, ScoringRule, Attempt), SessionError> = async {
            let (test, rule) = self.load_test().await?;
            let attempt = match self.shared.submit.attempts.get_attempt(pending.attempt_id).await {
                Ok(attempt) => attempt,
                Err(StorageError::NotFound) => {
                    return Err(SessionError::NotFound(Missing::Attempt(pending.attempt_id)));
                }
                Err(err) => return Err(err.into()),
            };
            Ok((test, rule, attempt))
        }
        .await;
        let (test, rule, attempt) = loaded.map_err(|err| self.abort_activation(err))?;

        pending.retries += 1;
        let mut cancel = {
            let mut core = self.core()?;
            let (_, cancel) = core.next_generation();
            let mut ledger = AnswerLedger::restore(attempt.id(), pending.answers.iter());
            let _ = ledger.seal();
            core.state = SessionState::Submitting;
            core.activating = false;
            core.submitting = true;
            core.attempt = Some(attempt);
            core.test = Some(Arc::clone(&test));
            core.rule = rule;
            core.ledger = Some(ledger);
            core.remaining_secs = 0;
            core.result = None;
            core.last_error = None;
            self.publish(&core);
            cancel
        };

        self.shared.recovery.push(pending.clone());
        info!(retries = pending.retries, "replaying queued submission");
        let result = submission::run(&self.shared.submit, &pending, &test, &rule, &mut cancel).await;
        self.finish_submission(&pending, result)
    }

    fn finish_submission(
        &self,
        pending: &PendingSubmission,
        result: Result<SessionOutcome, SessionError>,
    ) -> Result<Option<SessionOutcome>, SessionError> {
        let attempt_id = pending.attempt_id;
        let mut core = self.core()?;
        let current = core.attempt.as_ref().map(Attempt::id) == Some(attempt_id)
            && core.state == SessionState::Submitting;
        if current {
            core.submitting = false;
        }

        match result {
            Ok(outcome) => {
                self.shared.recovery.remove(attempt_id);
                if current {
                    core.state = SessionState::Completed;
                    core.result = Some(outcome);
                    core.remaining_secs = 0;
                    core.last_error = None;
                    core.cancel = None;
                    self.publish(&core);
                }
                info!(
                    %attempt_id,
                    total_marks = outcome.breakdown.total_marks,
                    xp = outcome.xp.xp_earned,
                    xp_replayed = outcome.xp_replayed,
                    "attempt completed"
                );
                Ok(Some(outcome))
            }
            Err(SessionError::Cancelled) => {
                if current {
                    self.publish(&core);
                }
                warn!(%attempt_id, "submission cancelled; kept for recovery");
                Err(SessionError::Cancelled)
            }
            Err(err @ SessionError::InvalidTransition { from, .. }) => {
                // The attempt ended elsewhere; there is nothing left to replay.
                self.shared.recovery.remove(attempt_id);
                if current {
                    if from == AttemptStatus::Abandoned {
                        core.state = SessionState::Abandoned;
                    }
                    core.last_error = Some(err.to_string());
                    self.publish(&core);
                }
                warn!(%attempt_id, error = %err, "submission rejected");
                Err(err)
            }
            Err(err) => {
                if current {
                    core.last_error = Some(err.to_string());
                    self.publish(&core);
                }
                error!(%attempt_id, error = %err, "submission failed; kept for retry");
                match err {
                    SessionError::Storage(source) => Err(SessionError::SubmissionFailed {
                        attempt: attempt_id,
                        source,
                    }),
                    other => Err(other),
                }
            }
        }
    }

    //
    // ─── ABANDON / CLOSE ───────────────────────────────────────────────────────
    //

    /// Give up the active attempt. A new session may be started afterwards.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless active, or a storage error
    /// if the attempt could not be marked abandoned.
    #[tracing::instrument(skip_all)]
    pub async fn abandon(&self) -> Result<(), SessionError> {
        let attempt_id = {
            let mut core = self.core()?;
            core.require("abandon", SessionState::Active)?;
            let attempt_id = core.attempt_id("abandon")?;
            core.state = SessionState::Abandoned;
            core.cancel_in_flight();
            if let Some(ledger) = core.ledger.as_mut() {
                let _ = ledger.seal();
            }
            core.remaining_secs = 0;
            self.publish(&core);
            attempt_id
        };
        self.shared.timer.cancel();

        if let Err(err) = self.shared.submit.manager.abandon(attempt_id).await {
            if let Ok(mut core) = self.core() {
                core.last_error = Some(err.to_string());
                self.publish(&core);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Stop the timer and cancel in-flight requests without changing the attempt.
    ///
    /// An interrupted submission stays in the recovery queue.
    pub fn close(&self) {
        if let Ok(mut core) = self.core() {
            core.cancel_in_flight();
        }
        self.shared.timer.cancel();
        debug!("session closed");
    }

    //
    // ─── TIMER ─────────────────────────────────────────────────────────────────
    //

    async fn listen(self, generation: u64, mut events: mpsc::UnboundedReceiver<TimerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TimerEvent::Tick { remaining_secs } => {
                    if let Ok(mut core) = self.core() {
                        if core.generation == generation && core.state == SessionState::Active {
                            core.remaining_secs = remaining_secs;
                            self.publish(&core);
                        }
                    }
                }
                TimerEvent::Expired => {
                    info!(generation, "time is up; submitting");
                    if let Err(err) = self.submit_inner(EndedBy::Timeout, Some(generation)).await {
                        warn!(error = %err, "timeout submission failed");
                    }
                    break;
                }
            }
        }
    }
}

fn remaining_secs(test: &Test, attempt: &Attempt, now: DateTime<Utc>) -> u64 {
    let elapsed = u64::try_from(attempt.age(now).num_seconds().max(0)).unwrap_or(0);
    test.duration_seconds().saturating_sub(elapsed)
}
