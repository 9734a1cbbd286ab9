//! Event repository: append-only storage for pipeline events.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw event row. `id` is assigned by SQLite on insert and is strictly
/// increasing, which gives events a total order for replay.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub user_id: String,
    pub item_id: String,
    pub event_type: String,
    pub stage: Option<i64>,
    pub message: String,
    pub progress: f64,
    pub created_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            item_id: row.get("item_id")?,
            event_type: row.get("event_type")?,
            stage: row.get("stage")?,
            message: row.get("message")?,
            progress: row.get("progress")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Appends an event and returns its assigned id. The `id` field of the
/// argument is ignored.
pub fn insert(db: &Database, event: &EventRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO events (user_id, item_id, event_type, stage, message, progress, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.user_id,
                event.item_id,
                event.event_type,
                event.stage,
                event.message,
                event.progress,
                event.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Returns the user's most recent `limit` events, oldest first.
pub fn recent_for_user(
    db: &Database,
    user_id: &str,
    limit: u64,
) -> Result<Vec<EventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM events WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns the user's events with an id greater than `after_id`, oldest
/// first, capped at `limit`.
pub fn after_for_user(
    db: &Database,
    user_id: &str,
    after_id: i64,
    limit: u64,
) -> Result<Vec<EventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE user_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, after_id, limit as i64], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns every event recorded for one item, oldest first.
pub fn for_item(db: &Database, item_id: &str) -> Result<Vec<EventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM events WHERE item_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![item_id], EventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes events created before `cutoff` (RFC3339). Returns rows removed.
pub fn prune_before(db: &Database, cutoff: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let removed = conn.execute("DELETE FROM events WHERE created_at < ?1", params![cutoff])?;
        Ok(removed)
    })
}
