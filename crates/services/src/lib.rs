#![forbid(unsafe_code)]

pub mod app_services;
pub mod attempts;
pub mod config;
pub mod error;
pub mod sessions;
pub mod timer;
pub mod xp_awarder;

pub use exam_core::Clock;

pub use app_services::ExamServices;
pub use attempts::AttemptManager;
pub use config::{AnswerPersistence, RetryPolicy, SessionConfig};
pub use error::{AppServicesError, AttemptManagerError, ConfigError, SessionError, XpAwardError};
pub use sessions::{
    PendingSubmission, RecoveryQueue, SessionOrchestrator, SessionOutcome, SessionSnapshot,
    SessionState,
};
pub use timer::{TimerController, TimerEvent, TimerState};
pub use xp_awarder::{AwardOutcome, XpAwarder};
