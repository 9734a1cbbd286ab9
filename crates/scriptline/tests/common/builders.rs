//! Builders for creating test data programmatically.

#![allow(dead_code)]

use chrono::{Duration, Utc};

use scriptline::{Candidate, Settings, SourceType};

/// Builder for `Settings`, starting from an enabled pipeline.
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings {
                enabled: true,
                ..Settings::default()
            },
        }
    }

    pub fn disabled(mut self) -> Self {
        self.settings.enabled = false;
        self
    }

    pub fn daily_limit(mut self, limit: u32) -> Self {
        self.settings.daily_item_limit = limit;
        self
    }

    pub fn monthly_budget_cents(mut self, cents: u64) -> Self {
        self.settings.monthly_budget_cents = cents;
        self
    }

    pub fn min_score(mut self, threshold: f64) -> Self {
        self.settings.min_score_threshold = threshold;
        self
    }

    pub fn tone(mut self, tone: &str) -> Self {
        self.settings.style_preferences.tone = Some(tone.to_string());
        self
    }

    pub fn include(mut self, keyword: &str) -> Self {
        self.settings.include_keywords.push(keyword.to_string());
        self
    }

    pub fn exclude(mut self, keyword: &str) -> Self {
        self.settings.exclude_keywords.push(keyword.to_string());
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `Candidate`, defaulting to a one-hour-old news story.
pub struct CandidateBuilder {
    candidate: Candidate,
}

impl CandidateBuilder {
    pub fn news(source_ref: &str) -> Self {
        Self {
            candidate: Candidate {
                source_type: SourceType::News,
                source_ref: source_ref.to_string(),
                title: format!("Story {}", source_ref),
                body: "Regulators announced new rules for chip exports.".to_string(),
                published_at: Utc::now() - Duration::hours(1),
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.candidate.title = title.to_string();
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.candidate.body = body.to_string();
        self
    }

    pub fn source_type(mut self, source_type: SourceType) -> Self {
        self.candidate.source_type = source_type;
        self
    }

    pub fn hours_old(mut self, hours: i64) -> Self {
        self.candidate.published_at = Utc::now() - Duration::hours(hours);
        self
    }

    pub fn build(self) -> Candidate {
        self.candidate
    }
}
