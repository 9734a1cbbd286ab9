//! Lifecycle events emitted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::stage::StageId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StageStarted,
    StageCompleted,
    StageFailed,
    ItemStarted,
    ItemCompleted,
    ItemFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StageStarted => "stage_started",
            EventType::StageCompleted => "stage_completed",
            EventType::StageFailed => "stage_failed",
            EventType::ItemStarted => "item_started",
            EventType::ItemCompleted => "item_completed",
            EventType::ItemFailed => "item_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stage_started" => Some(EventType::StageStarted),
            "stage_completed" => Some(EventType::StageCompleted),
            "stage_failed" => Some(EventType::StageFailed),
            "item_started" => Some(EventType::ItemStarted),
            "item_completed" => Some(EventType::ItemCompleted),
            "item_failed" => Some(EventType::ItemFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    pub message: String,
    /// Percentage of stages completed when the event was emitted.
    pub progress: f64,
}

/// A persisted event. `id` orders events globally and doubles as the
/// stream cursor for resuming observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: String,
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

/// An event before it has been assigned an id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub user_id: String,
    pub item_id: String,
    pub stage: Option<StageId>,
    pub message: String,
    pub progress: f64,
}

impl NewEvent {
    pub fn new(
        event_type: EventType,
        user_id: &str,
        item_id: &str,
        stage: Option<StageId>,
        message: impl Into<String>,
        progress: f64,
    ) -> Self {
        Self {
            event_type,
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            stage,
            message: message.into(),
            progress,
        }
    }
}
