pub mod runner;
pub mod state;

pub use runner::Orchestrator;
pub use state::{RUN_FILE, RunMetadata, RunSummary, SUMMARY_FILE, StopReason};
