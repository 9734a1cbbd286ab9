//! Idempotency record repository.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A stored stage result keyed by its idempotency key.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub key: String,
    pub item_id: String,
    pub stage: i64,
    /// JSON-encoded result.
    pub result: String,
    pub created_at: String,
}

impl LedgerRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            key: row.get("key")?,
            item_id: row.get("item_id")?,
            stage: row.get("stage")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Looks up a record by key.
pub fn find(db: &Database, key: &str) -> Result<Option<LedgerRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM idempotency_records WHERE key = ?1",
                params![key],
                LedgerRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts a record unless the key is already present.
///
/// Returns `true` when this call stored the row, `false` when an earlier
/// writer won. The stored row is never replaced.
pub fn insert_if_absent(db: &Database, row: &LedgerRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO idempotency_records (key, item_id, stage, result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.key, row.item_id, row.stage, row.result, row.created_at],
        )?;
        Ok(inserted == 1)
    })
}

/// Counts records stored for an item.
pub fn count_for_item(db: &Database, item_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM idempotency_records WHERE item_id = ?1",
            params![item_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, result: &str) -> LedgerRow {
        LedgerRow {
            key: key.to_string(),
            item_id: "item-1".to_string(),
            stage: 2,
            result: result.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_first_writer_wins() {
        let db = Database::open_in_memory().unwrap();
        assert!(insert_if_absent(&db, &row("k1", r#"{"a":1}"#)).unwrap());
        assert!(!insert_if_absent(&db, &row("k1", r#"{"a":2}"#)).unwrap());

        let stored = find(&db, "k1").unwrap().unwrap();
        assert_eq!(stored.result, r#"{"a":1}"#);
        assert_eq!(count_for_item(&db, "item-1").unwrap(), 1);
    }

    #[test]
    fn test_find_missing() {
        let db = Database::open_in_memory().unwrap();
        assert!(find(&db, "absent").unwrap().is_none());
    }
}
