//! Usage counter repository: per-user item and spend totals per period.
//!
//! Counters are keyed by `(user_id, period_kind, period_key)` where the
//! kind is `day` or `month` and the key is the UTC date (`2026-03-01`) or
//! month (`2026-03`). Increments are single conditional statements so two
//! admissions racing on the same counter cannot both pass a limit check.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

pub const PERIOD_DAY: &str = "day";
pub const PERIOD_MONTH: &str = "month";

/// A raw usage counter row.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub user_id: String,
    pub period_kind: String,
    pub period_key: String,
    pub items: i64,
    pub spend_cents: i64,
    pub version: i64,
    pub updated_at: String,
}

impl UsageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            period_kind: row.get("period_kind")?,
            period_key: row.get("period_key")?,
            items: row.get("items")?,
            spend_cents: row.get("spend_cents")?,
            version: row.get("version")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Identifies one counter.
#[derive(Debug, Clone, Copy)]
pub struct Period<'a> {
    pub user_id: &'a str,
    pub kind: &'a str,
    pub key: &'a str,
}

fn ensure(conn: &rusqlite::Connection, period: &Period<'_>, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO usage_counters (user_id, period_kind, period_key, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![period.user_id, period.kind, period.key, now],
    )?;
    Ok(())
}

/// Returns the counter, if anything was ever recorded for the period.
pub fn get(db: &Database, period: &Period<'_>) -> Result<Option<UsageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM usage_counters
                 WHERE user_id = ?1 AND period_kind = ?2 AND period_key = ?3",
                params![period.user_id, period.kind, period.key],
                UsageRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Adds one admitted item to the counter, but only while the count stays
/// below `limit`. `None` means unlimited.
///
/// Returns `false` when the limit was already reached.
pub fn try_increment_items(
    db: &Database,
    period: &Period<'_>,
    limit: Option<i64>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        ensure(conn, period, now)?;
        let changed = conn.execute(
            "UPDATE usage_counters
             SET items = items + 1, version = version + 1, updated_at = ?4
             WHERE user_id = ?1 AND period_kind = ?2 AND period_key = ?3
               AND (?5 IS NULL OR items < ?5)",
            params![period.user_id, period.kind, period.key, now, limit],
        )?;
        Ok(changed == 1)
    })
}

/// Adds spend to the counter unconditionally.
pub fn add_spend(
    db: &Database,
    period: &Period<'_>,
    cents: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        ensure(conn, period, now)?;
        conn.execute(
            "UPDATE usage_counters
             SET spend_cents = spend_cents + ?4, version = version + 1, updated_at = ?5
             WHERE user_id = ?1 AND period_kind = ?2 AND period_key = ?3",
            params![period.user_id, period.kind, period.key, cents, now],
        )?;
        Ok(())
    })
}
