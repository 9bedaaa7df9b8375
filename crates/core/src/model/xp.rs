use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{AttemptId, TestId, UserId};

/// Origin of an XP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpSource {
    TestCompleted,
}

impl XpSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            XpSource::TestCompleted => "test_completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test_completed" => Some(Self::TestCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for XpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate XP counters on a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileXp {
    pub total_xp: u64,
    pub weekly_xp: u64,
}

/// XP grant to insert, keyed by the attempt that earned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewXpTransaction {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    pub test_id: TestId,
    pub source: XpSource,
    pub xp_earned: u32,
    pub created_at: DateTime<Utc>,
}

/// A recorded XP grant. At most one exists per attempt.
///
/// `applied` holds the profile counters right after this grant was added;
/// it is `None` until the profile increment has happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpTransaction {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    pub test_id: TestId,
    pub source: XpSource,
    pub xp_earned: u32,
    pub created_at: DateTime<Utc>,
    pub applied: Option<ProfileXp>,
}

impl XpTransaction {
    #[must_use]
    pub fn from_new(new: &NewXpTransaction) -> Self {
        Self {
            attempt_id: new.attempt_id,
            user_id: new.user_id,
            test_id: new.test_id,
            source: new.source,
            xp_earned: new.xp_earned,
            created_at: new.created_at,
            applied: None,
        }
    }

    /// The award outcome, once the profile increment is recorded.
    #[must_use]
    pub fn result(&self) -> Option<XpResult> {
        self.applied.map(|totals| XpResult {
            xp_earned: self.xp_earned,
            new_total_xp: totals.total_xp,
            new_weekly_xp: totals.weekly_xp,
        })
    }
}

/// What the presentation layer sees after an award.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpResult {
    pub xp_earned: u32,
    pub new_total_xp: u64,
    pub new_weekly_xp: u64,
}
