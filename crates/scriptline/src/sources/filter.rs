use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::SettingsError;
use crate::item::SourceType;
use crate::settings::Settings;

use super::Candidate;

/// Why a candidate was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    SourceTypeDisabled(SourceType),
    NoIncludedKeyword,
    ExcludedKeyword(String),
    TooOld { age_hours: i64 },
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::SourceTypeDisabled(t) => write!(f, "source type {} disabled", t.as_str()),
            Ineligible::NoIncludedKeyword => write!(f, "no include keyword matched"),
            Ineligible::ExcludedKeyword(k) => write!(f, "matched excluded keyword '{}'", k),
            Ineligible::TooOld { age_hours } => write!(f, "{}h old", age_hours),
        }
    }
}

/// Case-insensitive whole-word pattern. Word boundaries are only required
/// on sides where the keyword itself starts or ends with a word character.
fn keyword_pattern(keyword: &str) -> Result<Regex, SettingsError> {
    let keyword = keyword.trim();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let leading = keyword.chars().next().is_some_and(is_word);
    let trailing = keyword.chars().last().is_some_and(is_word);
    let pattern = format!(
        "(?i){}{}{}",
        if leading { r"\b" } else { "" },
        regex::escape(keyword),
        if trailing { r"\b" } else { "" },
    );
    Regex::new(&pattern).map_err(|e| SettingsError::InvalidKeyword {
        keyword: keyword.to_string(),
        reason: e.to_string(),
    })
}

/// Settings compiled for repeated candidate checks.
pub struct EligibilityFilter {
    source_types: Vec<SourceType>,
    include: Vec<Regex>,
    exclude: Vec<(String, Regex)>,
    max_age: Duration,
}

impl EligibilityFilter {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let include = settings
            .include_keywords
            .iter()
            .map(|k| keyword_pattern(k))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = settings
            .exclude_keywords
            .iter()
            .map(|k| keyword_pattern(k).map(|re| (k.trim().to_string(), re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source_types: settings.source_types.clone(),
            include,
            exclude,
            max_age: Duration::hours(i64::from(settings.max_content_age_hours)),
        })
    }

    pub fn check(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<(), Ineligible> {
        if !self.source_types.contains(&candidate.source_type) {
            return Err(Ineligible::SourceTypeDisabled(candidate.source_type));
        }

        let age = now - candidate.published_at;
        if age > self.max_age {
            return Err(Ineligible::TooOld {
                age_hours: age.num_hours(),
            });
        }

        let text = format!("{}\n{}", candidate.title, candidate.body);
        if let Some((keyword, _)) = self.exclude.iter().find(|(_, re)| re.is_match(&text)) {
            return Err(Ineligible::ExcludedKeyword(keyword.clone()));
        }
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(&text)) {
            return Err(Ineligible::NoIncludedKeyword);
        }
        Ok(())
    }
}
