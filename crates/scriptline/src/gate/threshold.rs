//! Adaptive gate threshold.
//!
//! The effective threshold starts at the user's `minScoreThreshold`
//! (clamped into the configured band) and moves a fraction of the way
//! toward a target after each human verdict on a delivered item:
//!
//! - approved with score `s`: target `min(t, s - margin)`, so the gate
//!   loosens when humans accept items close to the line;
//! - rejected with score `s`: target `max(t, s + margin)`, so the gate
//!   tightens past scores humans turned down.
//!
//! `t' = clamp(t + rate * (target - t), minBand, maxBand)`. The first
//! verdict recorded under a changed `minScoreThreshold` reseeds the value.
//! Reads never write: a gate deciding an item admitted under an older
//! `minScoreThreshold` gets that base, clamped, and leaves the row alone.

use chrono::Utc;
use thiserror::Error;

use crate::config::GateConfig;
use crate::db::threshold_repo::{self, ThresholdRow};
use crate::db::{Database, DatabaseError};

const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Threshold for user '{user_id}' is under heavy concurrent update")]
    Contention { user_id: String },
}

/// Pure update rule; the result always lies in `[min_band, max_band]`.
pub fn next_threshold(current: f64, final_score: f64, approved: bool, config: &GateConfig) -> f64 {
    if !final_score.is_finite() {
        return clamp(current, config);
    }
    let target = if approved {
        current.min(final_score - config.margin)
    } else {
        current.max(final_score + config.margin)
    };
    clamp(current + config.learning_rate * (target - current), config)
}

pub fn clamp(value: f64, config: &GateConfig) -> f64 {
    if value.is_nan() {
        return config.min_band;
    }
    value.clamp(config.min_band, config.max_band)
}

#[derive(Clone)]
pub struct GateThresholds {
    db: Database,
    config: GateConfig,
}

impl GateThresholds {
    pub fn new(db: Database, config: GateConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Loads the user's row, seeding or reseeding it from `base`.
    fn load(&self, user_id: &str, base: f64) -> Result<ThresholdRow, ThresholdError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            match threshold_repo::get(&self.db, user_id)? {
                None => {
                    let row = ThresholdRow {
                        user_id: user_id.to_string(),
                        base_threshold: base,
                        effective: clamp(base, &self.config),
                        samples: 0,
                        version: 0,
                        updated_at: Utc::now().to_rfc3339(),
                    };
                    if threshold_repo::insert_if_absent(&self.db, &row)? {
                        return Ok(row);
                    }
                }
                Some(row) if row.base_threshold != base => {
                    let reseeded = ThresholdRow {
                        base_threshold: base,
                        effective: clamp(base, &self.config),
                        samples: 0,
                        updated_at: Utc::now().to_rfc3339(),
                        ..row
                    };
                    if threshold_repo::update_versioned(&self.db, &reseeded)? {
                        tracing::info!(
                            user_id,
                            base,
                            effective = reseeded.effective,
                            "Gate threshold reseeded from settings"
                        );
                        return Ok(ThresholdRow {
                            version: reseeded.version + 1,
                            ..reseeded
                        });
                    }
                }
                Some(row) => return Ok(row),
            }
        }
        Err(ThresholdError::Contention {
            user_id: user_id.to_string(),
        })
    }

    /// The threshold a gate decision against `min_score_threshold` uses.
    pub fn effective(&self, user_id: &str, min_score_threshold: f64) -> Result<f64, ThresholdError> {
        Ok(match threshold_repo::get(&self.db, user_id)? {
            Some(row) if row.base_threshold == min_score_threshold => row.effective,
            _ => clamp(min_score_threshold, &self.config),
        })
    }

    /// Folds one human verdict into the threshold and returns the new value.
    pub fn record_feedback(
        &self,
        user_id: &str,
        min_score_threshold: f64,
        final_score: f64,
        approved: bool,
    ) -> Result<f64, ThresholdError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let row = self.load(user_id, min_score_threshold)?;
            let effective = next_threshold(row.effective, final_score, approved, &self.config);
            let updated = ThresholdRow {
                effective,
                samples: row.samples + 1,
                updated_at: Utc::now().to_rfc3339(),
                ..row.clone()
            };
            if threshold_repo::update_versioned(&self.db, &updated)? {
                tracing::info!(
                    user_id,
                    approved,
                    final_score,
                    from = row.effective,
                    to = effective,
                    "Gate threshold adjusted"
                );
                return Ok(effective);
            }
        }
        Err(ThresholdError::Contention {
            user_id: user_id.to_string(),
        })
    }
}
