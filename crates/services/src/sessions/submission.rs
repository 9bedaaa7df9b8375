//! The submit pipeline: persist answers, score, award XP, finalize.
//!
//! Every step tolerates being replayed after a partial success, so a failed
//! submission can be retried from its `PendingSubmission` alone.

use std::future::Future;
use std::sync::Arc;

use exam_core::model::{AnswerRecord, AttemptId, AttemptStatus, ScoringRule, Test};
use exam_core::scoring::{answer_records, score};
use storage::repository::{AttemptRepository, StorageError};
use tokio::sync::watch;
use tracing::debug;

use super::recovery::PendingSubmission;
use super::retry::with_retry;
use super::state::SessionOutcome;
use crate::attempts::AttemptManager;
use crate::config::RetryPolicy;
use crate::error::{AttemptManagerError, SessionError};
use crate::xp_awarder::XpAwarder;

#[derive(Clone)]
pub(crate) struct SubmitDeps {
    pub(crate) attempts: Arc<dyn AttemptRepository>,
    pub(crate) manager: AttemptManager,
    pub(crate) awarder: XpAwarder,
    pub(crate) retry: RetryPolicy,
}

/// Resolve `fut`, or fail with `Cancelled` as soon as `cancel` fires.
pub(crate) async fn cancellable<T, F>(
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    if *cancel.borrow() {
        return Err(SessionError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.wait_for(|cancelled| *cancelled) => Err(SessionError::Cancelled),
        result = fut => result,
    }
}

pub(crate) async fn run(
    deps: &SubmitDeps,
    pending: &PendingSubmission,
    test: &Test,
    rule: &ScoringRule,
    cancel: &mut watch::Receiver<bool>,
) -> Result<SessionOutcome, SessionError> {
    let attempt_id = pending.attempt_id;
    let records = answer_records(attempt_id, test.questions(), &pending.answers);
    cancellable(cancel, persist_answers(deps, attempt_id, &records)).await?;
    cancellable(cancel, ensure_not_abandoned(deps, attempt_id)).await?;

    let breakdown = score(test.questions(), &pending.answers, rule);

    let award = cancellable(cancel, async {
        with_retry(deps.retry, "award_xp", || {
            deps.awarder
                .award(attempt_id, pending.user_id, pending.test_id, &breakdown)
        })
        .await
        .map_err(SessionError::from)
    })
    .await?;

    cancellable(cancel, finalize(deps, pending, breakdown.total_marks)).await?;

    Ok(SessionOutcome {
        attempt_id,
        ended_by: pending.ended_by,
        breakdown,
        xp: award.result(),
        xp_replayed: award.is_replay(),
    })
}

async fn persist_answers(
    deps: &SubmitDeps,
    attempt_id: AttemptId,
    records: &[AnswerRecord],
) -> Result<(), SessionError> {
    let written = with_retry(deps.retry, "write_answers", || {
        deps.attempts.write_answers(attempt_id, records)
    })
    .await;

    match written {
        Ok(()) => Ok(()),
        Err(StorageError::Conflict) => {
            let attempt = deps.attempts.get_attempt(attempt_id).await?;
            if attempt.status() == AttemptStatus::Completed {
                debug!(%attempt_id, "answers were persisted by an earlier run");
                Ok(())
            } else {
                Err(SessionError::InvalidTransition {
                    attempt: attempt_id,
                    from: attempt.status(),
                })
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Refuse to grant XP for an attempt abandoned after its answers landed.
///
/// A completed attempt passes: that is a replay of an earlier run.
async fn ensure_not_abandoned(
    deps: &SubmitDeps,
    attempt_id: AttemptId,
) -> Result<(), SessionError> {
    let attempt = with_retry(deps.retry, "check_attempt", || {
        deps.attempts.get_attempt(attempt_id)
    })
    .await?;
    if attempt.status() == AttemptStatus::Abandoned {
        return Err(SessionError::InvalidTransition {
            attempt: attempt_id,
            from: AttemptStatus::Abandoned,
        });
    }
    Ok(())
}

async fn finalize(
    deps: &SubmitDeps,
    pending: &PendingSubmission,
    total_marks: f64,
) -> Result<(), SessionError> {
    let finalized = with_retry(deps.retry, "finalize_attempt", || {
        deps.manager
            .finalize(pending.attempt_id, pending.ended_by, total_marks)
    })
    .await;

    match finalized {
        Ok(_)
        | Err(AttemptManagerError::InvalidTransition {
            from: AttemptStatus::Completed,
            ..
        }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
