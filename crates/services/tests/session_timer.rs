mod common;

use std::time::Duration;

use common::{correct, q, sample_test, seed};
use exam_core::model::{AttemptStatus, EndedBy, TestId, UserId};
use exam_core::time::fixed_clock;
use services::{ExamServices, SessionConfig, SessionState};
use storage::repository::{AttemptRepository, InMemoryRepository, Storage, XpRepository};

fn services_over(repo: &InMemoryRepository) -> ExamServices {
    ExamServices::from_storage(
        Storage::from_repo(repo.clone()),
        fixed_clock(),
        SessionConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn countdown_is_published_every_second() {
    let repo = InMemoryRepository::new();
    let test = sample_test(TestId::new(1), 2, 1);
    seed(&repo, &test, None).await;
    let session = services_over(&repo).session(UserId::random(), test.id());

    session.start().await.unwrap();
    assert_eq!(session.snapshot().remaining_secs, 60);

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(session.snapshot().remaining_secs, 55);
    assert_eq!(session.state(), SessionState::Active);
    session.close();
}

#[tokio::test(start_paused = true)]
async fn expiry_with_no_answers_scores_everything_unanswered() {
    let repo = InMemoryRepository::new();
    let test = sample_test(TestId::new(1), 3, 1);
    seed(&repo, &test, None).await;
    let user = UserId::random();
    let session = services_over(&repo).session(user, test.id());
    let mut updates = session.subscribe();

    let attempt = session.start().await.unwrap();
    let snapshot = updates
        .wait_for(|s| s.state == SessionState::Completed)
        .await
        .unwrap()
        .clone();

    let outcome = snapshot.result.unwrap();
    assert_eq!(outcome.ended_by, EndedBy::Timeout);
    assert_eq!(outcome.breakdown.unanswered, 3);
    assert_eq!(outcome.breakdown.correct, 0);
    assert!(outcome.breakdown.total_marks.abs() < f64::EPSILON);
    assert_eq!(outcome.xp.xp_earned, 10);
    assert_eq!(snapshot.remaining_secs, 0);

    let stored = repo.get_attempt(attempt.id()).await.unwrap();
    assert_eq!(stored.status(), AttemptStatus::Completed);
    assert_eq!(stored.ended_by(), Some(EndedBy::Timeout));
    assert!(repo.list_answers(attempt.id()).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn expiry_racing_a_user_submit_completes_once() {
    let repo = InMemoryRepository::new();
    let test = sample_test(TestId::new(1), 2, 1);
    seed(&repo, &test, None).await;
    let user = UserId::random();
    let session = services_over(&repo).session(user, test.id());
    let mut updates = session.subscribe();

    let attempt = session.start().await.unwrap();
    session.answer(q(1), correct(1)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let submitted = session.submit(EndedBy::User).await.unwrap();
    updates
        .wait_for(|s| s.state == SessionState::Completed)
        .await
        .unwrap();

    let outcome = session.snapshot().result.unwrap();
    if let Some(submitted) = submitted {
        assert_eq!(submitted, outcome);
    }
    let stored = repo.get_attempt(attempt.id()).await.unwrap();
    assert_eq!(stored.ended_by(), Some(outcome.ended_by));
    assert_eq!(
        repo.get_profile_xp(user).await.unwrap().total_xp,
        u64::from(outcome.xp.xp_earned)
    );
    assert_eq!(session.submit(EndedBy::User).await.unwrap(), Some(outcome));
}

#[tokio::test(start_paused = true)]
async fn abandoning_stops_the_countdown() {
    let repo = InMemoryRepository::new();
    let test = sample_test(TestId::new(1), 1, 1);
    seed(&repo, &test, None).await;
    let session = services_over(&repo).session(UserId::random(), test.id());

    let attempt = session.start().await.unwrap();
    session.abandon().await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(session.state(), SessionState::Abandoned);
    assert_eq!(
        repo.get_attempt(attempt.id()).await.unwrap().status(),
        AttemptStatus::Abandoned
    );
    assert!(repo.find_xp_transaction(attempt.id()).await.unwrap().is_none());
}
