//! Runtime orchestrator: runs the forecast pipeline for one init time.
//!
//! `Pending → Assembling → Inferring → Reconciling → Writing → Completed`,
//! or `Failed` on unrecoverable conditions.

pub mod orchestrator;
pub mod types;

pub use orchestrator::RunOrchestrator;
pub use types::*;
