//! Gate threshold repository.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// Persisted adaptive threshold for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRow {
    pub user_id: String,
    /// The configured minimum score the effective value was seeded from.
    pub base_threshold: f64,
    pub effective: f64,
    /// Number of feedback samples folded in since seeding.
    pub samples: i64,
    pub version: i64,
    pub updated_at: String,
}

impl ThresholdRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            base_threshold: row.get("base_threshold")?,
            effective: row.get("effective")?,
            samples: row.get("samples")?,
            version: row.get("version")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn get(db: &Database, user_id: &str) -> Result<Option<ThresholdRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM gate_thresholds WHERE user_id = ?1",
                params![user_id],
                ThresholdRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts the row unless one already exists for the user.
pub fn insert_if_absent(db: &Database, row: &ThresholdRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO gate_thresholds
             (user_id, base_threshold, effective, samples, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.user_id,
                row.base_threshold,
                row.effective,
                row.samples,
                row.version,
                row.updated_at
            ],
        )?;
        Ok(inserted == 1)
    })
}

/// Writes the row if the stored version still equals `row.version`.
pub fn update_versioned(db: &Database, row: &ThresholdRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE gate_thresholds
             SET base_threshold = ?2, effective = ?3, samples = ?4, updated_at = ?5,
                 version = version + 1
             WHERE user_id = ?1 AND version = ?6",
            params![
                row.user_id,
                row.base_threshold,
                row.effective,
                row.samples,
                row.updated_at,
                row.version
            ],
        )?;
        Ok(changed == 1)
    })
}
