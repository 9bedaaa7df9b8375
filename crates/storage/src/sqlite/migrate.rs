use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

const SCHEMA_V1: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS tests (
        id INTEGER PRIMARY KEY,
        exam_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0)
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS questions (
        id INTEGER PRIMARY KEY,
        test_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        text TEXT NOT NULL,
        legacy_correct_answer TEXT,
        FOREIGN KEY (test_id) REFERENCES tests(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS question_options (
        id INTEGER NOT NULL,
        question_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        text TEXT NOT NULL,
        is_correct INTEGER NOT NULL DEFAULT 0 CHECK (is_correct IN (0, 1)),
        PRIMARY KEY (question_id, id),
        FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS scoring_rules (
        exam_id INTEGER PRIMARY KEY,
        marks_correct REAL NOT NULL,
        marks_incorrect REAL NOT NULL,
        marks_unanswered REAL NOT NULL
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        test_id INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed', 'abandoned')),
        started_at TEXT NOT NULL,
        ended_at TEXT,
        ended_by TEXT CHECK (ended_by IN ('user', 'timeout', 'system')),
        score REAL
    );
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_active
        ON attempts (user_id, test_id) WHERE status = 'in_progress';
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_attempts_status_started
        ON attempts (status, started_at);
    ",
    r"
    CREATE TABLE IF NOT EXISTS attempt_answers (
        attempt_id INTEGER NOT NULL,
        question_id INTEGER NOT NULL,
        option_id INTEGER NOT NULL,
        is_correct INTEGER NOT NULL CHECK (is_correct IN (0, 1)),
        PRIMARY KEY (attempt_id, question_id),
        FOREIGN KEY (attempt_id) REFERENCES attempts(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS xp_transactions (
        attempt_id INTEGER PRIMARY KEY,
        user_id TEXT NOT NULL,
        test_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        xp_earned INTEGER NOT NULL CHECK (xp_earned >= 0),
        created_at TEXT NOT NULL,
        applied_at TEXT,
        total_after INTEGER,
        weekly_after INTEGER
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS profiles (
        user_id TEXT PRIMARY KEY,
        total_xp INTEGER NOT NULL DEFAULT 0 CHECK (total_xp >= 0),
        weekly_xp INTEGER NOT NULL DEFAULT 0 CHECK (weekly_xp >= 0),
        week_start TEXT NOT NULL
    );
    ",
];

/// Runs versioned migrations, each inside its own transaction.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: catalog, attempts, answers and XP.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;
        for statement in SCHEMA_V1 {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
            .bind(1_i64)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version = 1, "applied schema migration");
    }

    Ok(())
}
