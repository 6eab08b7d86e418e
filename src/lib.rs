pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod run_config;
pub mod stage;

pub use orchestrator::{RunOrchestrator, RunOutcome};
