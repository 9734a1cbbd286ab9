//! The per-item record the engine advances through the stages.

pub mod progress;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gate::GateDecision;
use crate::pipeline::context::ItemContext;
use crate::pipeline::stage::StageId;
use crate::settings::ItemSettings;

pub use progress::{ItemProgress, StageProgress, StageState};
pub use store::{ItemStore, ItemStoreError, StatusCounts};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    News,
    ShortVideo,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::News => "news",
            SourceType::ShortVideo => "short_video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "news" => Some(SourceType::News),
            "short_video" => Some(SourceType::ShortVideo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ItemStatus::Processing),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            "cancelled" => Some(ItemStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ItemStatus::Processing)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a failed item failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A stage errored or declared the item unfit. Retryable.
    Error,
    /// The gate rejected the item. Terminal.
    Rejected,
    /// A stage exceeded its time limit. Retryable.
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Rejected => "rejected",
            FailureKind::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(FailureKind::Error),
            "rejected" => Some(FailureKind::Rejected),
            "timeout" => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

/// One execution of one stage. Appended, never edited after the attempt
/// finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempt {
    pub stage: StageId,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// True only when the stage succeeded.
    pub completed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cost_cents: u64,
}

/// Human verdict on a delivered item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub approved: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub user_id: String,
    pub source_type: SourceType,
    pub source_ref: String,
    pub title: String,
    pub content: String,
    /// 1..=9 while processing; 10 once Delivery has completed.
    pub current_stage: u8,
    pub status: ItemStatus,
    pub stage_history: Vec<StageAttempt>,
    pub context: ItemContext,
    /// Settings in force when the item was admitted.
    pub settings: ItemSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    pub version: i64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to admit a new item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub user_id: String,
    pub source_type: SourceType,
    pub source_ref: String,
    pub title: String,
    pub content: String,
    pub settings: ItemSettings,
}

impl Item {
    /// A freshly admitted item: processing, at stage 1, empty history.
    pub fn new(new: NewItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            source_type: new.source_type,
            source_ref: new.source_ref,
            title: new.title,
            content: new.content,
            current_stage: StageId::Scout.number(),
            status: ItemStatus::Processing,
            stage_history: Vec::new(),
            context: ItemContext::new(),
            settings: new.settings,
            error_stage: None,
            error_message: None,
            failure_kind: None,
            retry_count: 0,
            cancel_requested: false,
            feedback: None,
            version: 0,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The stage to run next, if the item is still in the pipeline.
    pub fn stage(&self) -> Option<StageId> {
        StageId::from_number(self.current_stage)
    }

    /// Distinct stages with at least one completed attempt.
    pub fn completed_stages(&self) -> Vec<StageId> {
        let mut stages: Vec<StageId> = self
            .stage_history
            .iter()
            .filter(|a| a.completed)
            .map(|a| a.stage)
            .collect();
        stages.sort();
        stages.dedup();
        stages
    }

    pub fn has_completed(&self, stage: StageId) -> bool {
        self.stage_history
            .iter()
            .any(|a| a.stage == stage && a.completed)
    }

    /// The gate's verdict, once stage 8 has run.
    pub fn gate_decision(&self) -> Option<GateDecision> {
        self.context
            .get(StageId::Gate)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_retryable(&self) -> bool {
        self.status == ItemStatus::Failed && self.failure_kind != Some(FailureKind::Rejected)
    }

    /// Total spend billed across all attempts.
    pub fn total_cost_cents(&self) -> u64 {
        self.stage_history.iter().map(|a| a.cost_cents).sum()
    }
}
