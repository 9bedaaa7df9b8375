#![forbid(unsafe_code)]

mod args;
mod seed;
mod telemetry;

use std::path::Path;
use std::time::Duration as StdDuration;

use args::{Args, ArgsError, Command, Finish, print_usage};
use exam_core::model::{EndedBy, OptionId, QuestionId, TestId, UserId};
use services::{Clock, ExamServices, RecoveryQueue, SessionConfig, SessionSnapshot, SessionState};
use tokio::sync::watch;
use tracing::{info, warn};

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.is_empty() || matches!(argv[0].as_str(), "--help" | "-h" | "help") {
        print_usage();
        return Ok(());
    }

    let parsed = Args::parse(argv, std::env::var("EXAM_DB_URL").ok()).map_err(|e| {
        print_usage();
        e
    })?;
    telemetry::init_tracing()?;
    let config = SessionConfig::from_env()?;

    // Open + migrate SQLite before any command touches it.
    prepare_sqlite_file(&parsed.db_url)?;
    let services = ExamServices::new_sqlite(&parsed.db_url, Clock::default_clock(), config).await?;

    match parsed.command {
        Command::Migrate => {
            info!(db_url = %parsed.db_url, "database is up to date");
            Ok(())
        }
        Command::Seed {
            test_id,
            questions,
            minutes,
        } => {
            let test =
                seed::seed(services.storage().tests.as_ref(), test_id, questions, minutes).await?;
            println!(
                "{}",
                serde_json::json!({
                    "test_id": test.id(),
                    "exam_id": test.exam_id(),
                    "questions": test.question_count(),
                    "duration_minutes": test.duration_minutes(),
                })
            );
            Ok(())
        }
        Command::Cleanup { watch_secs } => cleanup(&services, watch_secs).await,
        Command::Run {
            user_id,
            test_id,
            answers,
            finish,
            restart,
            queue,
        } => {
            let services = match &queue {
                Some(path) => services.with_recovery(load_queue(path)?),
                None => services,
            };
            let outcome =
                run_session(&services, user_id, test_id, &answers, finish, restart).await;
            if let Some(path) = &queue {
                save_queue(path, services.recovery())?;
            }
            let snapshot = outcome?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Recover { queue } => {
            let services = services.with_recovery(load_queue(&queue)?);
            let result = recover(&services).await;
            save_queue(&queue, services.recovery())?;
            result
        }
    }
}

async fn cleanup(
    services: &ExamServices,
    watch_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = services.attempts();
    let threshold = services.config().stale_cleanup_after;

    let Some(secs) = watch_secs else {
        let abandoned = manager.cleanup_stale(threshold).await?;
        println!("{}", serde_json::json!({ "abandoned": abandoned }));
        return Ok(());
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(manager.run_cleanup_loop(
        StdDuration::from_secs(secs.max(1)),
        threshold,
        shutdown_rx,
    ));
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    worker.await?;
    Ok(())
}

async fn run_session(
    services: &ExamServices,
    user_id: UserId,
    test_id: TestId,
    answers: &[(QuestionId, OptionId)],
    finish: Finish,
    restart: bool,
) -> Result<SessionSnapshot, Box<dyn std::error::Error>> {
    if restart {
        let fresh = services
            .attempts()
            .force_abandon_and_restart(user_id, test_id)
            .await?;
        info!(attempt_id = %fresh.id(), "restarted attempt");
    }

    let session = services.session(user_id, test_id);
    let attempt = session.start().await?;
    if session.attempts().needs_resume_prompt(&attempt) {
        warn!(attempt_id = %attempt.id(), "resuming an old attempt; pass --restart to begin afresh");
    }

    for (question, option) in answers {
        session.answer(*question, *option).await?;
    }

    match finish {
        Finish::Leave => session.close(),
        Finish::Submit => {
            session.submit(EndedBy::User).await?;
        }
        Finish::Abandon => session.abandon().await?,
        Finish::WaitForTimeout => {
            let mut updates = session.subscribe();
            updates
                .wait_for(|s| matches!(s.state, SessionState::Completed | SessionState::Abandoned))
                .await?;
        }
    }
    Ok(session.snapshot())
}

async fn recover(services: &ExamServices) -> Result<(), Box<dyn std::error::Error>> {
    let pending = services.recovery().list();
    info!(count = pending.len(), "replaying queued submissions");

    let mut completed = Vec::new();
    let mut failed = 0_usize;
    for submission in pending {
        let session = services.session(submission.user_id, submission.test_id);
        let attempt_id = submission.attempt_id;
        match session.replay(submission).await {
            Ok(Some(outcome)) => completed.push(outcome),
            Ok(None) => {}
            Err(err) => {
                failed += 1;
                warn!(%attempt_id, error = %err, "replay failed");
            }
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "completed": completed,
            "failed": failed,
            "remaining": services.recovery().len(),
        }))?
    );
    Ok(())
}

fn load_queue(path: &Path) -> Result<RecoveryQueue, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(RecoveryQueue::new());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(RecoveryQueue::new());
    }
    Ok(RecoveryQueue::from_json(&raw)?)
}

fn save_queue(path: &Path, queue: &RecoveryQueue) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, queue.to_json()?)?;
    Ok(())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
