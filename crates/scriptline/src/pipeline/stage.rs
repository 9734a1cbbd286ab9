//! The stage contract every pipeline step implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gate::GateDecision;
use crate::item::Item;
use crate::settings::ItemSettings;

use super::context::ItemContext;
use super::error::StageError;

/// The nine stages, in execution order. Serialized as the stage number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StageId {
    Scout = 1,
    Scorer = 2,
    Analyst = 3,
    Architect = 4,
    Writer = 5,
    Qc = 6,
    Optimizer = 7,
    Gate = 8,
    Delivery = 9,
}

impl StageId {
    pub const ALL: [StageId; 9] = [
        StageId::Scout,
        StageId::Scorer,
        StageId::Analyst,
        StageId::Architect,
        StageId::Writer,
        StageId::Qc,
        StageId::Optimizer,
        StageId::Gate,
        StageId::Delivery,
    ];

    /// Number of stages an item passes through.
    pub const COUNT: u8 = 9;

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }

    /// Display name used in events and progress.
    pub fn name(self) -> &'static str {
        match self {
            StageId::Scout => "Scout",
            StageId::Scorer => "Scorer",
            StageId::Analyst => "Analyst",
            StageId::Architect => "Architect",
            StageId::Writer => "Writer",
            StageId::Qc => "QC",
            StageId::Optimizer => "Optimizer",
            StageId::Gate => "Gate",
            StageId::Delivery => "Delivery",
        }
    }

    /// Stable lowercase key used in URLs, context maps and cost tables.
    pub fn slug(self) -> &'static str {
        match self {
            StageId::Scout => "scout",
            StageId::Scorer => "scorer",
            StageId::Analyst => "analyst",
            StageId::Architect => "architect",
            StageId::Writer => "writer",
            StageId::Qc => "qc",
            StageId::Optimizer => "optimizer",
            StageId::Gate => "gate",
            StageId::Delivery => "delivery",
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.number())
    }
}

impl From<StageId> for u8 {
    fn from(stage: StageId) -> u8 {
        stage.number()
    }
}

impl TryFrom<u8> for StageId {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        StageId::from_number(n).ok_or_else(|| format!("stage number {} out of range 1..=9", n))
    }
}

/// Everything a stage may read. Stages never mutate the item directly;
/// the engine applies their result.
pub struct StageInput<'a> {
    pub item: &'a Item,
    pub context: &'a ItemContext,
    /// The item's admission-time snapshot, never the user's live settings.
    pub settings: &'a ItemSettings,
}

/// Successful output of a non-gate stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub data: serde_json::Value,
    pub cost_cents: u64,
    /// False when the result was served from the idempotency ledger and
    /// nothing was billed by this attempt.
    pub fresh: bool,
}

impl StageOutput {
    /// Output produced locally, without an external call.
    pub fn local(data: serde_json::Value) -> Self {
        Self {
            data,
            cost_cents: 0,
            fresh: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageResult {
    Success(StageOutput),
    /// The stage ran but declared the item unfit to continue. `cost_cents`
    /// is what this attempt billed, if anything.
    Failure { reason: String, cost_cents: u64 },
    /// Only produced by the gate.
    GateDecision(GateDecision),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError>;
}
