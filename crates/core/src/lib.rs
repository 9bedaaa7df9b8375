#![forbid(unsafe_code)]

pub mod error;
pub mod ledger;
pub mod model;
pub mod rewards;
pub mod scoring;
pub mod time;

pub use error::Error;
pub use ledger::{AnswerLedger, AnswerSnapshot, LedgerError};
pub use rewards::XpPolicy;
pub use scoring::{ScoreBreakdown, score};
pub use time::Clock;
