//! Budget guard: per-user daily admission count and monthly spend.
//!
//! Counters live in `usage_counters`, one row per (user, period). Periods
//! are UTC calendar days and months, so a limit reached today clears at
//! the next UTC midnight.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::usage_repo::{self, Period, PERIOD_DAY, PERIOD_MONTH};
use crate::db::{Database, DatabaseError};
use crate::settings::Settings;

#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Machine-readable reason an admission was refused.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    DailyLimitReached,
    BudgetExceeded,
    AlreadyProcessing,
    PipelineDisabled,
}

impl DenialReason {
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::DailyLimitReached => "daily_limit_reached",
            DenialReason::BudgetExceeded => "budget_exceeded",
            DenialReason::AlreadyProcessing => "already_processing",
            DenialReason::PipelineDisabled => "pipeline_disabled",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DenialReason::DailyLimitReached => "Daily item limit reached",
            DenialReason::BudgetExceeded => "Monthly budget exhausted",
            DenialReason::AlreadyProcessing => "A pipeline run is already in progress",
            DenialReason::PipelineDisabled => "Pipeline is disabled in settings",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Current usage against the user's limits.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub day: String,
    pub month: String,
    pub items_today: u64,
    pub daily_item_limit: u32,
    pub month_spend_cents: u64,
    pub monthly_budget_cents: u64,
}

pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[derive(Clone)]
pub struct BudgetGuard {
    db: Database,
}

impl BudgetGuard {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn can_admit(
        &self,
        user_id: &str,
        settings: &Settings,
    ) -> Result<AdmissionDecision, BudgetError> {
        self.can_admit_at(user_id, settings, Utc::now())
    }

    /// Checks both limits as of `now`. Read-only; admission itself goes
    /// through [`record_admission_at`](Self::record_admission_at).
    pub fn can_admit_at(
        &self,
        user_id: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision, BudgetError> {
        let usage = self.usage_at(user_id, settings, now)?;
        if usage.items_today >= u64::from(settings.daily_item_limit) {
            return Ok(AdmissionDecision::deny(DenialReason::DailyLimitReached));
        }
        if usage.month_spend_cents >= settings.monthly_budget_cents {
            return Ok(AdmissionDecision::deny(DenialReason::BudgetExceeded));
        }
        Ok(AdmissionDecision::allow())
    }

    pub fn record_admission(
        &self,
        user_id: &str,
        settings: &Settings,
    ) -> Result<AdmissionDecision, BudgetError> {
        self.record_admission_at(user_id, settings, Utc::now())
    }

    /// Counts one admitted item against today, re-checking both limits so
    /// concurrent admissions cannot overshoot the daily limit.
    pub fn record_admission_at(
        &self,
        user_id: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision, BudgetError> {
        let decision = self.can_admit_at(user_id, settings, now)?;
        if !decision.allowed {
            return Ok(decision);
        }

        let day = day_key(now);
        let month = month_key(now);
        let stamp = now.to_rfc3339();
        let day_period = Period {
            user_id,
            kind: PERIOD_DAY,
            key: &day,
        };
        if !usage_repo::try_increment_items(
            &self.db,
            &day_period,
            Some(i64::from(settings.daily_item_limit)),
            &stamp,
        )? {
            return Ok(AdmissionDecision::deny(DenialReason::DailyLimitReached));
        }
        let month_period = Period {
            user_id,
            kind: PERIOD_MONTH,
            key: &month,
        };
        usage_repo::try_increment_items(&self.db, &month_period, None, &stamp)?;
        Ok(AdmissionDecision::allow())
    }

    pub fn record_spend(&self, user_id: &str, cents: u64) -> Result<(), BudgetError> {
        self.record_spend_at(user_id, cents, Utc::now())
    }

    /// Adds a stage's reported cost to today's and this month's totals.
    pub fn record_spend_at(
        &self,
        user_id: &str,
        cents: u64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        if cents == 0 {
            return Ok(());
        }
        let cents = i64::try_from(cents).unwrap_or(i64::MAX);
        let stamp = now.to_rfc3339();
        let day = day_key(now);
        let month = month_key(now);
        for (kind, key) in [(PERIOD_DAY, &day), (PERIOD_MONTH, &month)] {
            usage_repo::add_spend(
                &self.db,
                &Period {
                    user_id,
                    kind,
                    key,
                },
                cents,
                &stamp,
            )?;
        }
        Ok(())
    }

    pub fn usage(&self, user_id: &str, settings: &Settings) -> Result<UsageSnapshot, BudgetError> {
        self.usage_at(user_id, settings, Utc::now())
    }

    pub fn usage_at(
        &self,
        user_id: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, BudgetError> {
        let day = day_key(now);
        let month = month_key(now);
        let today = usage_repo::get(
            &self.db,
            &Period {
                user_id,
                kind: PERIOD_DAY,
                key: &day,
            },
        )?;
        let this_month = usage_repo::get(
            &self.db,
            &Period {
                user_id,
                kind: PERIOD_MONTH,
                key: &month,
            },
        )?;
        Ok(UsageSnapshot {
            items_today: today.map(|r| r.items.max(0) as u64).unwrap_or(0),
            month_spend_cents: this_month
                .map(|r| r.spend_cents.max(0) as u64)
                .unwrap_or(0),
            daily_item_limit: settings.daily_item_limit,
            monthly_budget_cents: settings.monthly_budget_cents,
            day,
            month,
        })
    }
}
