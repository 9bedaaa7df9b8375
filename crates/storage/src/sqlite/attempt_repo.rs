use chrono::{DateTime, Utc};
use exam_core::model::{AnswerRecord, Attempt, AttemptId, AttemptStatus, OptionId, QuestionId, TestId, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{
    ATTEMPT_COLUMNS, attempt_id_from_i64, conn, i64_to_u64, map_attempt_row, ser, u64_to_i64,
    write_err,
};
use crate::repository::{AttemptRepository, StatusUpdate, StorageError};

impl SqliteRepository {
    async fn attempt_status(&self, id: i64) -> Result<Option<AttemptStatus>, StorageError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM attempts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        status
            .map(|s| s.parse::<AttemptStatus>().map_err(ser))
            .transpose()
    }
}

#[async_trait::async_trait]
impl AttemptRepository for SqliteRepository {
    async fn create_attempt(
        &self,
        user_id: UserId,
        test_id: TestId,
        started_at: DateTime<Utc>,
    ) -> Result<Attempt, StorageError> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO attempts (user_id, test_id, status, started_at)
            VALUES (?1, ?2, 'in_progress', ?3)
            RETURNING {ATTEMPT_COLUMNS}
            "
        ))
        .bind(user_id.to_string())
        .bind(u64_to_i64("test_id", test_id.value())?)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(write_err)?;

        map_attempt_row(&row)
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<Attempt, StorageError> {
        let row = sqlx::query(&format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1"))
            .bind(u64_to_i64("attempt_id", id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_attempt_row(&row)
    }

    async fn find_attempts(
        &self,
        user_id: UserId,
        test_id: TestId,
        status: AttemptStatus,
    ) -> Result<Vec<Attempt>, StorageError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ATTEMPT_COLUMNS}
            FROM attempts
            WHERE user_id = ?1 AND test_id = ?2 AND status = ?3
            ORDER BY id ASC
            "
        ))
        .bind(user_id.to_string())
        .bind(u64_to_i64("test_id", test_id.value())?)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_attempt_row).collect()
    }

    async fn list_in_progress_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Attempt>, StorageError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ATTEMPT_COLUMNS}
            FROM attempts
            WHERE status = 'in_progress' AND started_at < ?1
            ORDER BY started_at ASC, id ASC
            "
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_attempt_row).collect()
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        update: StatusUpdate,
    ) -> Result<Attempt, StorageError> {
        let raw_id = u64_to_i64("attempt_id", id.value())?;
        let (ended_at, ended_by, score) = match update {
            StatusUpdate::Complete {
                ended_at,
                ended_by,
                score,
            } => (Some(ended_at), Some(ended_by.as_str()), Some(score)),
            StatusUpdate::Abandon => (None, None, None),
        };

        let row = sqlx::query(&format!(
            r"
            UPDATE attempts
            SET status = ?2, ended_at = ?3, ended_by = ?4, score = ?5
            WHERE id = ?1 AND status = 'in_progress'
            RETURNING {ATTEMPT_COLUMNS}
            "
        ))
        .bind(raw_id)
        .bind(update.target().as_str())
        .bind(ended_at)
        .bind(ended_by)
        .bind(score)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        match row {
            Some(row) => map_attempt_row(&row),
            None => match self.attempt_status(raw_id).await? {
                None => Err(StorageError::NotFound),
                Some(_) => Err(StorageError::Conflict),
            },
        }
    }

    async fn write_answers(
        &self,
        attempt_id: AttemptId,
        answers: &[AnswerRecord],
    ) -> Result<(), StorageError> {
        let raw_id = u64_to_i64("attempt_id", attempt_id.value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM attempts WHERE id = ?1")
            .bind(raw_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn)?;
        match status.as_deref() {
            None => return Err(StorageError::NotFound),
            Some(s) if s != AttemptStatus::InProgress.as_str() => {
                return Err(StorageError::Conflict);
            }
            Some(_) => {}
        }

        for record in answers {
            sqlx::query(
                r"
                INSERT INTO attempt_answers (attempt_id, question_id, option_id, is_correct)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(attempt_id, question_id) DO UPDATE SET
                    option_id = excluded.option_id,
                    is_correct = excluded.is_correct
                ",
            )
            .bind(raw_id)
            .bind(u64_to_i64("question_id", record.question_id.value())?)
            .bind(u64_to_i64("option_id", record.option_id.value())?)
            .bind(record.is_correct)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)?;
        Ok(())
    }

    async fn list_answers(&self, attempt_id: AttemptId) -> Result<Vec<AnswerRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT attempt_id, question_id, option_id, is_correct
            FROM attempt_answers
            WHERE attempt_id = ?1
            ORDER BY question_id ASC
            ",
        )
        .bind(u64_to_i64("attempt_id", attempt_id.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(AnswerRecord {
                attempt_id: attempt_id_from_i64(row.try_get("attempt_id").map_err(ser)?)?,
                question_id: QuestionId::new(i64_to_u64(
                    "question_id",
                    row.try_get("question_id").map_err(ser)?,
                )?),
                option_id: OptionId::new(i64_to_u64(
                    "option_id",
                    row.try_get("option_id").map_err(ser)?,
                )?),
                is_correct: row.try_get("is_correct").map_err(ser)?,
            });
        }
        Ok(records)
    }
}
