use chrono::{DateTime, Utc};
use exam_core::model::{
    Attempt, AttemptId, AttemptStatus, EndedBy, NewXpTransaction, ProfileXp, TestId, UserId,
    XpSource, XpTransaction,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

/// Map a write failure, turning unique-constraint violations into `Conflict`.
pub(crate) fn write_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict,
        _ => conn(e),
    }
}

pub(crate) fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn u64_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn attempt_id_from_i64(v: i64) -> Result<AttemptId, StorageError> {
    Ok(AttemptId::new(i64_to_u64("attempt_id", v)?))
}

pub(crate) fn test_id_from_i64(v: i64) -> Result<TestId, StorageError> {
    Ok(TestId::new(i64_to_u64("test_id", v)?))
}

pub(crate) fn user_id_from_str(s: &str) -> Result<UserId, StorageError> {
    s.parse::<UserId>().map_err(ser)
}

pub(crate) const ATTEMPT_COLUMNS: &str =
    "id, user_id, test_id, status, started_at, ended_at, ended_by, score";

pub(crate) fn map_attempt_row(row: &SqliteRow) -> Result<Attempt, StorageError> {
    let status: String = row.try_get("status").map_err(ser)?;
    let ended_by: Option<String> = row.try_get("ended_by").map_err(ser)?;
    let user_id: String = row.try_get("user_id").map_err(ser)?;

    Attempt::from_persisted(
        attempt_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        user_id_from_str(&user_id)?,
        test_id_from_i64(row.try_get::<i64, _>("test_id").map_err(ser)?)?,
        status.parse::<AttemptStatus>().map_err(ser)?,
        row.try_get("started_at").map_err(ser)?,
        row.try_get("ended_at").map_err(ser)?,
        ended_by
            .as_deref()
            .map(str::parse::<EndedBy>)
            .transpose()
            .map_err(ser)?,
        row.try_get("score").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) const XP_COLUMNS: &str = "attempt_id, user_id, test_id, source, xp_earned, created_at, applied_at, total_after, weekly_after";

pub(crate) fn map_xp_row(row: &SqliteRow) -> Result<XpTransaction, StorageError> {
    let source: String = row.try_get("source").map_err(ser)?;
    let user_id: String = row.try_get("user_id").map_err(ser)?;
    let xp_earned: i64 = row.try_get("xp_earned").map_err(ser)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(ser)?;

    let applied_at: Option<DateTime<Utc>> = row.try_get("applied_at").map_err(ser)?;
    let applied = match applied_at {
        None => None,
        Some(_) => {
            let total: i64 = row.try_get("total_after").map_err(ser)?;
            let weekly: i64 = row.try_get("weekly_after").map_err(ser)?;
            Some(ProfileXp {
                total_xp: i64_to_u64("total_after", total)?,
                weekly_xp: i64_to_u64("weekly_after", weekly)?,
            })
        }
    };

    let tx = NewXpTransaction {
        attempt_id: attempt_id_from_i64(row.try_get::<i64, _>("attempt_id").map_err(ser)?)?,
        user_id: user_id_from_str(&user_id)?,
        test_id: test_id_from_i64(row.try_get::<i64, _>("test_id").map_err(ser)?)?,
        source: XpSource::parse(&source)
            .ok_or_else(|| StorageError::Serialization(format!("invalid xp source: {source}")))?,
        xp_earned: u32::try_from(xp_earned)
            .map_err(|_| StorageError::Serialization(format!("invalid xp_earned: {xp_earned}")))?,
        created_at,
    };
    Ok(XpTransaction {
        applied,
        ..XpTransaction::from_new(&tx)
    })
}
