//! Per-user pipeline settings.
//!
//! Written only through [`SettingsStore::put`]. Admission reads a fresh
//! copy on every cycle and stamps the fields stages need onto each new item
//! as an [`ItemSettings`], so a change applies from the next cycle and never
//! to an item already in the pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{settings_repo, Database};
use crate::error::SettingsError;
use crate::item::SourceType;

const MAX_KEYWORD_LEN: usize = 64;
const MAX_KEYWORDS: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StylePreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_source_types")]
    pub source_types: Vec<SourceType>,
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default = "default_max_content_age_hours")]
    pub max_content_age_hours: u32,
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,
    #[serde(default = "default_daily_item_limit")]
    pub daily_item_limit: u32,
    #[serde(default = "default_monthly_budget_cents")]
    pub monthly_budget_cents: u64,
    #[serde(default)]
    pub style_preferences: StylePreferences,
}

fn default_source_types() -> Vec<SourceType> {
    vec![SourceType::News, SourceType::ShortVideo]
}

fn default_max_content_age_hours() -> u32 {
    48
}

fn default_min_score_threshold() -> f64 {
    65.0
}

fn default_daily_item_limit() -> u32 {
    10
}

fn default_monthly_budget_cents() -> u64 {
    5_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            source_types: default_source_types(),
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            max_content_age_hours: default_max_content_age_hours(),
            min_score_threshold: default_min_score_threshold(),
            daily_item_limit: default_daily_item_limit(),
            monthly_budget_cents: default_monthly_budget_cents(),
            style_preferences: StylePreferences::default(),
        }
    }
}

/// The part of [`Settings`] an item carries through the pipeline, frozen at
/// admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemSettings {
    pub min_score_threshold: f64,
    #[serde(default)]
    pub style_preferences: StylePreferences,
}

impl From<&Settings> for ItemSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            min_score_threshold: settings.min_score_threshold,
            style_preferences: settings.style_preferences.clone(),
        }
    }
}

impl Default for ItemSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.source_types.is_empty() {
            return Err(SettingsError::Invalid {
                field: "sourceTypes",
                reason: "at least one source type is required".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&self.min_score_threshold) {
            return Err(SettingsError::Invalid {
                field: "minScoreThreshold",
                reason: format!("{} is outside 0..=100", self.min_score_threshold),
            });
        }
        if self.max_content_age_hours == 0 {
            return Err(SettingsError::Invalid {
                field: "maxContentAgeHours",
                reason: "must be positive".to_string(),
            });
        }
        for (field, list) in [
            ("includeKeywords", &self.include_keywords),
            ("excludeKeywords", &self.exclude_keywords),
        ] {
            if list.len() > MAX_KEYWORDS {
                return Err(SettingsError::Invalid {
                    field,
                    reason: format!("at most {} keywords allowed", MAX_KEYWORDS),
                });
            }
            for keyword in list {
                let trimmed = keyword.trim();
                if trimmed.is_empty() || trimmed.len() > MAX_KEYWORD_LEN {
                    return Err(SettingsError::InvalidKeyword {
                        keyword: keyword.clone(),
                        reason: format!("must be 1..={} characters", MAX_KEYWORD_LEN),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The user's settings, or the defaults if none were saved.
    pub fn get(&self, user_id: &str) -> Result<Settings, SettingsError> {
        match settings_repo::get(&self.db, user_id)? {
            Some(data) => serde_json::from_str(&data).map_err(|source| SettingsError::Corrupt {
                user_id: user_id.to_string(),
                source,
            }),
            None => Ok(Settings::default()),
        }
    }

    pub fn put(&self, user_id: &str, settings: &Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        let data = serde_json::to_string(settings).map_err(|source| SettingsError::Corrupt {
            user_id: user_id.to_string(),
            source,
        })?;
        settings_repo::upsert(&self.db, user_id, &data, &Utc::now().to_rfc3339())?;
        tracing::info!(user_id, enabled = settings.enabled, "Settings updated");
        Ok(())
    }

    /// Users whose settings enable the pipeline.
    pub fn enabled_users(&self) -> Result<Vec<String>, SettingsError> {
        Ok(settings_repo::enabled_users(&self.db)?)
    }
}
