pub mod admission;
pub mod scheduler;

pub use admission::{AdmissionError, Orchestrator, TriggerOutcome};
pub use scheduler::TriggerScheduler;
