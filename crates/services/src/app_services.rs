use std::sync::Arc;

use exam_core::model::{TestId, UserId};
use storage::repository::Storage;
use tracing::info;

use crate::Clock;
use crate::attempts::AttemptManager;
use crate::config::SessionConfig;
use crate::error::AppServicesError;
use crate::sessions::{RecoveryQueue, SessionOrchestrator};
use crate::xp_awarder::XpAwarder;

/// Assembles the session services over one storage backend.
///
/// Every session built here shares the same recovery queue, so a failed
/// submission stays visible to whoever handles recovery.
#[derive(Clone)]
pub struct ExamServices {
    storage: Arc<Storage>,
    clock: Clock,
    config: SessionConfig,
    recovery: RecoveryQueue,
}

impl ExamServices {
    /// Build services backed by `SQLite` storage, running migrations first.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: SessionConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        info!(db_url, "sqlite storage ready");
        Ok(Self::from_storage(storage, clock, config))
    }

    #[must_use]
    pub fn in_memory(clock: Clock, config: SessionConfig) -> Self {
        Self::from_storage(Storage::in_memory(), clock, config)
    }

    #[must_use]
    pub fn from_storage(storage: Storage, clock: Clock, config: SessionConfig) -> Self {
        Self {
            storage: Arc::new(storage),
            clock,
            config,
            recovery: RecoveryQueue::new(),
        }
    }

    /// Use `recovery` instead of a fresh queue, e.g. one restored from disk.
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryQueue) -> Self {
        self.recovery = recovery;
        self
    }

    /// A new session of `user_id` on `test_id`.
    #[must_use]
    pub fn session(&self, user_id: UserId, test_id: TestId) -> SessionOrchestrator {
        SessionOrchestrator::new(
            user_id,
            test_id,
            &self.storage,
            self.clock,
            self.config,
            self.recovery.clone(),
        )
    }

    #[must_use]
    pub fn attempts(&self) -> AttemptManager {
        AttemptManager::new(self.clock, Arc::clone(&self.storage.attempts))
            .with_resume_prompt_after(self.config.resume_prompt_after)
    }

    #[must_use]
    pub fn awarder(&self) -> XpAwarder {
        XpAwarder::new(self.clock, Arc::clone(&self.storage.xp), self.config.xp_policy)
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryQueue {
        &self.recovery
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }
}
