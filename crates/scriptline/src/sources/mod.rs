//! Candidate content the admission cycle picks from.
//!
//! Ingestion connectors live outside this crate; they hand candidates in
//! through [`CandidateSource`].

pub mod filter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{NewItem, SourceType};
use crate::settings::ItemSettings;

pub use filter::{EligibilityFilter, Ineligible};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Candidate source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub source_type: SourceType,
    /// Stable reference (URL or upstream id); one item per user per ref.
    pub source_ref: String,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

impl Candidate {
    pub fn into_new_item(self, user_id: &str, settings: ItemSettings) -> NewItem {
        NewItem {
            user_id: user_id.to_string(),
            source_type: self.source_type,
            source_ref: self.source_ref,
            title: self.title,
            content: self.body,
            settings,
        }
    }
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Current candidates for `user_id`, best first.
    async fn candidates(&self, user_id: &str) -> Result<Vec<Candidate>, SourceError>;
}

/// In-memory source, fed by whoever owns the process.
#[derive(Clone, Default)]
pub struct StaticCandidateSource {
    by_user: Arc<Mutex<HashMap<String, Vec<Candidate>>>>,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, user_id: &str, candidate: Candidate) {
        if let Ok(mut by_user) = self.by_user.lock() {
            by_user
                .entry(user_id.to_string())
                .or_default()
                .push(candidate);
        }
    }

    pub fn extend(&self, user_id: &str, candidates: impl IntoIterator<Item = Candidate>) {
        for candidate in candidates {
            self.push(user_id, candidate);
        }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn candidates(&self, user_id: &str) -> Result<Vec<Candidate>, SourceError> {
        let by_user = self
            .by_user
            .lock()
            .map_err(|_| SourceError::Unavailable("candidate list lock poisoned".to_string()))?;
        Ok(by_user.get(user_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;

    pub fn candidate(source_ref: &str, title: &str, hours_old: i64) -> Candidate {
        Candidate {
            source_type: SourceType::News,
            source_ref: source_ref.to_string(),
            title: title.to_string(),
            body: format!("{} body text", title),
            published_at: Utc::now() - Duration::hours(hours_old),
        }
    }
}
