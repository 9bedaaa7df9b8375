use chrono::{DateTime, NaiveDate, Utc};
use exam_core::model::{AttemptId, NewXpTransaction, ProfileXp, UserId, XpTransaction};
use exam_core::time::week_start;
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{XP_COLUMNS, conn, i64_to_u64, map_xp_row, ser, u64_to_i64, write_err};
use crate::repository::{StorageError, XpRepository};

#[async_trait::async_trait]
impl XpRepository for SqliteRepository {
    async fn insert_xp_transaction(
        &self,
        tx: &NewXpTransaction,
    ) -> Result<XpTransaction, StorageError> {
        sqlx::query(
            r"
            INSERT INTO xp_transactions (attempt_id, user_id, test_id, source, xp_earned, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(u64_to_i64("attempt_id", tx.attempt_id.value())?)
        .bind(tx.user_id.to_string())
        .bind(u64_to_i64("test_id", tx.test_id.value())?)
        .bind(tx.source.as_str())
        .bind(i64::from(tx.xp_earned))
        .bind(tx.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;

        Ok(XpTransaction::from_new(tx))
    }

    async fn find_xp_transaction(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<XpTransaction>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {XP_COLUMNS} FROM xp_transactions WHERE attempt_id = ?1"
        ))
        .bind(u64_to_i64("attempt_id", attempt_id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        row.as_ref().map(map_xp_row).transpose()
    }

    async fn increment_profile_xp(
        &self,
        user_id: UserId,
        attempt_id: AttemptId,
        amount: u32,
        at: DateTime<Utc>,
    ) -> Result<ProfileXp, StorageError> {
        let raw_attempt = u64_to_i64("attempt_id", attempt_id.value())?;
        let user = user_id.to_string();
        let mut tx = self.pool.begin().await.map_err(conn)?;

        // The claim is the first statement so the write lock is taken up front.
        let claimed = sqlx::query(
            r"
            UPDATE xp_transactions SET applied_at = ?2
            WHERE attempt_id = ?1 AND applied_at IS NULL
            ",
        )
        .bind(raw_attempt)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.map_err(conn)?;
            return match self.find_xp_transaction(attempt_id).await? {
                None => Err(StorageError::NotFound),
                Some(existing) => existing.applied.ok_or(StorageError::Conflict),
            };
        }

        let week = week_start(at);
        let current = sqlx::query("SELECT total_xp, weekly_xp, week_start FROM profiles WHERE user_id = ?1")
            .bind(&user)
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn)?;

        let (mut total, mut weekly) = (0_u64, 0_u64);
        if let Some(row) = current {
            total = i64_to_u64("total_xp", row.try_get("total_xp").map_err(ser)?)?;
            let stored_week: NaiveDate = row.try_get("week_start").map_err(ser)?;
            if stored_week == week {
                weekly = i64_to_u64("weekly_xp", row.try_get("weekly_xp").map_err(ser)?)?;
            }
        }
        total = total.saturating_add(u64::from(amount));
        weekly = weekly.saturating_add(u64::from(amount));
        let total_db = u64_to_i64("total_xp", total)?;
        let weekly_db = u64_to_i64("weekly_xp", weekly)?;

        sqlx::query(
            r"
            INSERT INTO profiles (user_id, total_xp, weekly_xp, week_start)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                total_xp = excluded.total_xp,
                weekly_xp = excluded.weekly_xp,
                week_start = excluded.week_start
            ",
        )
        .bind(&user)
        .bind(total_db)
        .bind(weekly_db)
        .bind(week)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        sqlx::query(
            r"
            UPDATE xp_transactions SET total_after = ?2, weekly_after = ?3
            WHERE attempt_id = ?1
            ",
        )
        .bind(raw_attempt)
        .bind(total_db)
        .bind(weekly_db)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        tx.commit().await.map_err(conn)?;
        tracing::debug!(%user_id, %attempt_id, amount, total, weekly, "profile xp incremented");

        Ok(ProfileXp {
            total_xp: total,
            weekly_xp: weekly,
        })
    }

    async fn get_profile_xp(&self, user_id: UserId) -> Result<ProfileXp, StorageError> {
        let row = sqlx::query("SELECT total_xp, weekly_xp FROM profiles WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        match row {
            None => Ok(ProfileXp::default()),
            Some(row) => Ok(ProfileXp {
                total_xp: i64_to_u64("total_xp", row.try_get("total_xp").map_err(ser)?)?,
                weekly_xp: i64_to_u64("weekly_xp", row.try_get("weekly_xp").map_err(ser)?)?,
            }),
        }
    }
}
