use std::collections::HashMap;

use exam_core::model::{ExamId, OptionDraft, OptionId, QuestionDraft, QuestionId, ScoringRule, Test, TestId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, i64_to_u64, ser, u64_to_i64};
use crate::legacy::parse_legacy_answer;
use crate::repository::{StorageError, TestRepository};

fn position(i: usize) -> Result<i64, StorageError> {
    i64::try_from(i).map_err(|_| StorageError::Serialization("position overflow".into()))
}

#[async_trait::async_trait]
impl TestRepository for SqliteRepository {
    async fn get_test(&self, id: TestId) -> Result<Test, StorageError> {
        let test_id = u64_to_i64("test_id", id.value())?;

        let row = sqlx::query(
            r"
            SELECT exam_id, title, duration_minutes
            FROM tests WHERE id = ?1
            ",
        )
        .bind(test_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;

        let exam_id = ExamId::new(i64_to_u64("exam_id", row.try_get("exam_id").map_err(ser)?)?);
        let title: String = row.try_get("title").map_err(ser)?;
        let duration: i64 = row.try_get("duration_minutes").map_err(ser)?;
        let duration = u32::try_from(duration)
            .map_err(|_| StorageError::Serialization(format!("invalid duration: {duration}")))?;

        let option_rows = sqlx::query(
            r"
            SELECT o.question_id, o.id, o.text, o.is_correct
            FROM question_options o
            JOIN questions q ON q.id = o.question_id
            WHERE q.test_id = ?1
            ORDER BY o.question_id ASC, o.position ASC, o.id ASC
            ",
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut options: HashMap<i64, Vec<OptionDraft>> = HashMap::new();
        for row in option_rows {
            let question_id: i64 = row.try_get("question_id").map_err(ser)?;
            let option_id: i64 = row.try_get("id").map_err(ser)?;
            options.entry(question_id).or_default().push(OptionDraft::new(
                OptionId::new(i64_to_u64("option_id", option_id)?),
                row.try_get::<String, _>("text").map_err(ser)?,
                row.try_get::<bool, _>("is_correct").map_err(ser)?,
            ));
        }

        let question_rows = sqlx::query(
            r"
            SELECT id, text, legacy_correct_answer
            FROM questions
            WHERE test_id = ?1
            ORDER BY position ASC, id ASC
            ",
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut questions = Vec::with_capacity(question_rows.len());
        for row in question_rows {
            let raw_id: i64 = row.try_get("id").map_err(ser)?;
            let legacy: Option<String> = row.try_get("legacy_correct_answer").map_err(ser)?;
            let draft = QuestionDraft {
                id: QuestionId::new(i64_to_u64("question_id", raw_id)?),
                text: row.try_get("text").map_err(ser)?,
                options: options.remove(&raw_id).unwrap_or_default(),
                legacy_answer: legacy.as_deref().and_then(parse_legacy_answer),
            };
            questions.push(draft.validate().map_err(ser)?);
        }

        Test::new(id, exam_id, title, duration, questions).map_err(ser)
    }

    async fn get_scoring_rule(&self, exam_id: ExamId) -> Result<ScoringRule, StorageError> {
        let row = sqlx::query(
            r"
            SELECT marks_correct, marks_incorrect, marks_unanswered
            FROM scoring_rules WHERE exam_id = ?1
            ",
        )
        .bind(u64_to_i64("exam_id", exam_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;

        ScoringRule::new(
            row.try_get("marks_correct").map_err(ser)?,
            row.try_get("marks_incorrect").map_err(ser)?,
            row.try_get("marks_unanswered").map_err(ser)?,
        )
        .map_err(ser)
    }

    async fn upsert_test(&self, test: &Test) -> Result<(), StorageError> {
        let test_id = u64_to_i64("test_id", test.id().value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        sqlx::query(
            r"
            INSERT INTO tests (id, exam_id, title, duration_minutes)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                exam_id = excluded.exam_id,
                title = excluded.title,
                duration_minutes = excluded.duration_minutes
            ",
        )
        .bind(test_id)
        .bind(u64_to_i64("exam_id", test.exam_id().value())?)
        .bind(test.title())
        .bind(i64::from(test.duration_minutes()))
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        // Options cascade with their question.
        sqlx::query("DELETE FROM questions WHERE test_id = ?1")
            .bind(test_id)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        for (q_pos, question) in test.questions().iter().enumerate() {
            let question_id = u64_to_i64("question_id", question.id().value())?;
            sqlx::query(
                r"
                INSERT INTO questions (id, test_id, position, text, legacy_correct_answer)
                VALUES (?1, ?2, ?3, ?4, NULL)
                ",
            )
            .bind(question_id)
            .bind(test_id)
            .bind(position(q_pos)?)
            .bind(question.text())
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

            for (o_pos, option) in question.options().iter().enumerate() {
                sqlx::query(
                    r"
                    INSERT INTO question_options (id, question_id, position, text, is_correct)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ",
                )
                .bind(u64_to_i64("option_id", option.id.value())?)
                .bind(question_id)
                .bind(position(o_pos)?)
                .bind(option.text.as_str())
                .bind(question.is_correct(option.id))
                .execute(&mut *tx)
                .await
                .map_err(conn)?;
            }
        }

        tx.commit().await.map_err(conn)?;
        Ok(())
    }

    async fn upsert_scoring_rule(
        &self,
        exam_id: ExamId,
        rule: &ScoringRule,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO scoring_rules (exam_id, marks_correct, marks_incorrect, marks_unanswered)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(exam_id) DO UPDATE SET
                marks_correct = excluded.marks_correct,
                marks_incorrect = excluded.marks_incorrect,
                marks_unanswered = excluded.marks_unanswered
            ",
        )
        .bind(u64_to_i64("exam_id", exam_id.value())?)
        .bind(rule.marks_correct())
        .bind(rule.penalty_incorrect())
        .bind(rule.marks_unanswered())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }
}
