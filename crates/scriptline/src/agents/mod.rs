//! Boundary to the text-generation service that scores and writes.
//!
//! The engine only sees [`ContentAgent`]; what each stage asks the service
//! to do is the service's business.

pub mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::SourceType;
use crate::pipeline::stage::StageId;
use crate::settings::StylePreferences;

pub use http::HttpContentAgent;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent request timed out")]
    Timeout,

    #[error("Agent transport error: {0}")]
    Transport(String),

    #[error("Agent returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Agent rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Invalid agent response: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    /// Worth retrying later without changing anything.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Timeout | AgentError::Transport(_) => true,
            AgentError::Http { status, .. } => *status >= 500 || *status == 429,
            AgentError::Unauthorized(_) | AgentError::InvalidResponse(_) => false,
        }
    }
}

/// What a stage sends to the service. Built only from values that decide
/// the result, so it can double as idempotency-key input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub item_id: String,
    pub stage: StageId,
    pub source_type: SourceType,
    pub title: String,
    pub content: String,
    /// Outputs of earlier stages keyed by stage number.
    pub upstream: BTreeMap<u8, serde_json::Value>,
    pub style: StylePreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<u64>,
}

#[async_trait]
pub trait ContentAgent: Send + Sync {
    async fn run(&self, stage: StageId, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}
