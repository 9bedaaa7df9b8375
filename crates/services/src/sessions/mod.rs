mod orchestrator;
mod recovery;
mod retry;
mod state;
mod submission;

// Public API of the session subsystem.
pub use orchestrator::SessionOrchestrator;
pub use recovery::{PendingSubmission, RecoveryQueue};
pub use state::{SessionOutcome, SessionSnapshot, SessionState};
