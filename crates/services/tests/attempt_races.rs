mod common;

use common::{RacingAttempts, sample_test, seed};
use exam_core::model::{AttemptStatus, TestId, UserId};
use exam_core::time::fixed_clock;
use services::{ExamServices, SessionConfig, SessionState};
use storage::repository::{AttemptRepository, InMemoryRepository};

#[tokio::test]
async fn concurrent_starts_converge_on_one_attempt() {
    let inner = InMemoryRepository::new();
    let test = sample_test(TestId::new(1), 2, 30);
    seed(&inner, &test, None).await;
    let racing = RacingAttempts::new(inner.clone());
    let services =
        ExamServices::from_storage(racing.storage(), fixed_clock(), SessionConfig::default());
    let user = UserId::random();

    let left = services.session(user, test.id());
    let right = services.session(user, test.id());
    let (a, b) = tokio::join!(left.start(), right.start());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(racing.creates(), 2);
    assert_eq!(a.id(), b.id());
    assert_eq!(left.state(), SessionState::Active);
    assert_eq!(right.state(), SessionState::Active);

    let active = inner
        .find_attempts(user, test.id(), AttemptStatus::InProgress)
        .await
        .unwrap();
    let abandoned = inner
        .find_attempts(user, test.id(), AttemptStatus::Abandoned)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id(), a.id());
    assert_eq!(abandoned.len(), 1);
    assert_ne!(abandoned[0].id(), a.id());

    left.close();
    right.close();
}

#[tokio::test]
async fn unique_index_backends_also_converge() {
    let repo = InMemoryRepository::new().with_unique_active_attempts();
    let test = sample_test(TestId::new(1), 2, 30);
    seed(&repo, &test, None).await;
    let services = ExamServices::from_storage(
        storage::repository::Storage::from_repo(repo.clone()),
        fixed_clock(),
        SessionConfig::default(),
    );
    let user = UserId::random();

    let manager = services.attempts();
    let first = manager.start(user, test.id()).await.unwrap();
    let again = manager.start(user, test.id()).await.unwrap();
    assert_eq!(first.id(), again.id());

    let restarted = manager
        .force_abandon_and_restart(user, test.id())
        .await
        .unwrap();
    assert_ne!(restarted.id(), first.id());
    assert_eq!(
        repo.get_attempt(first.id()).await.unwrap().status(),
        AttemptStatus::Abandoned
    );
}
