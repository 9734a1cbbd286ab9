use thiserror::Error;

use crate::agents::AgentError;
use crate::budget::BudgetError;
use crate::gate::ThresholdError;
use crate::item::{ItemStatus, ItemStoreError};
use crate::ledger::LedgerError;

/// Failure of a single stage attempt. Recorded on the item; never
/// propagated to whoever triggered the run.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent call failed: {0}")]
    Agent(#[from] AgentError),

    #[error("Idempotency ledger failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Missing input from stage {stage}: {what}")]
    MissingInput { stage: &'static str, what: String },

    #[error("Invalid stage output: {0}")]
    Invalid(String),

    #[error("Threshold lookup failed: {0}")]
    Threshold(#[from] ThresholdError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Optimistic-versioning loss. Safe to retry after reloading.
    #[error("Item '{item_id}' was modified concurrently")]
    Conflict { item_id: String },

    #[error("Item '{0}' not found")]
    NotFound(String),

    #[error("Item '{item_id}' is {status}; operation requires {expected}")]
    InvalidState {
        item_id: String,
        status: ItemStatus,
        expected: &'static str,
    },

    #[error("Item '{0}' was rejected by the gate and cannot be retried")]
    NotRetryable(String),

    #[error("Feedback already recorded for item '{0}'")]
    FeedbackAlreadyRecorded(String),

    #[error("Item '{0}' has no stage to run")]
    NoStage(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::error::SettingsError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Threshold error: {0}")]
    Threshold(#[from] ThresholdError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}

impl From<ItemStoreError> for EngineError {
    fn from(e: ItemStoreError) -> Self {
        match e {
            ItemStoreError::Conflict { item_id } => EngineError::Conflict { item_id },
            ItemStoreError::Database(e) => EngineError::Database(e),
        }
    }
}
