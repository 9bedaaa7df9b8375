use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use exam_core::AnswerSnapshot;
use exam_core::model::{AttemptId, EndedBy, TestId, UserId};
use serde::{Deserialize, Serialize};

/// Everything needed to replay a submission that did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    pub test_id: TestId,
    pub answers: AnswerSnapshot,
    pub ended_by: EndedBy,
    pub queued_at: DateTime<Utc>,
    /// Number of replays attempted so far.
    #[serde(default)]
    pub retries: u32,
}

/// Submissions waiting for a successful replay, keyed by attempt.
///
/// Cloning shares the queue. An outer layer may persist `to_json` output and
/// feed it back through `from_json` after a restart.
#[derive(Clone, Default)]
pub struct RecoveryQueue {
    pending: Arc<Mutex<BTreeMap<AttemptId, PendingSubmission>>>,
}

impl RecoveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `submission`, replacing an older entry for the same attempt.
    pub fn push(&self, submission: PendingSubmission) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(submission.attempt_id, submission);
        }
    }

    #[must_use]
    pub fn get(&self, attempt_id: AttemptId) -> Option<PendingSubmission> {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.get(&attempt_id).cloned())
    }

    pub fn remove(&self, attempt_id: AttemptId) -> Option<PendingSubmission> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&attempt_id))
    }

    /// Pending submissions, oldest attempt first.
    #[must_use]
    pub fn list(&self) -> Vec<PendingSubmission> {
        self.pending
            .lock()
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().map_or(0, |pending| pending.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Errors
    ///
    /// Returns the serializer error if encoding fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.list())
    }

    /// # Errors
    ///
    /// Returns the deserializer error for malformed input.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let queue = Self::new();
        for submission in serde_json::from_str::<Vec<PendingSubmission>>(raw)? {
            queue.push(submission);
        }
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{OptionId, QuestionId};
    use exam_core::time::fixed_now;

    fn pending(id: u64) -> PendingSubmission {
        PendingSubmission {
            attempt_id: AttemptId::new(id),
            user_id: UserId::random(),
            test_id: TestId::new(1),
            answers: [(QuestionId::new(1), OptionId::new(2))].into_iter().collect(),
            ended_by: EndedBy::Timeout,
            queued_at: fixed_now(),
            retries: 0,
        }
    }

    #[test]
    fn push_replaces_per_attempt() {
        let queue = RecoveryQueue::new();
        queue.push(pending(1));
        let mut again = pending(1);
        again.retries = 2;
        queue.push(again.clone());
        queue.push(pending(2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(AttemptId::new(1)), Some(again));
        assert!(queue.remove(AttemptId::new(2)).is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn survives_a_json_restart() {
        let queue = RecoveryQueue::new();
        queue.push(pending(7));
        let raw = queue.to_json().unwrap();

        let restored = RecoveryQueue::from_json(&raw).unwrap();
        assert_eq!(restored.list(), queue.list());
        assert_eq!(
            restored.get(AttemptId::new(7)).unwrap().answers.get(QuestionId::new(1)),
            Some(OptionId::new(2))
        );
    }
}
