//! Item repository: CRUD operations for the `items` table.
//!
//! Every mutation after insert goes through [`update_versioned`], which only
//! succeeds when the caller still holds the current `version`.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw item row from the database.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: String,
    pub user_id: String,
    pub source_type: String,
    pub source_ref: String,
    pub title: String,
    pub content: String,
    pub current_stage: i64,
    pub status: String,
    /// JSON array of stage attempts.
    pub stage_history: String,
    /// JSON object of stage outputs keyed by stage slug.
    pub context: String,
    pub error_stage: Option<i64>,
    pub error_message: Option<String>,
    pub failure_kind: Option<String>,
    pub retry_count: i64,
    pub cancel_requested: bool,
    pub feedback: Option<String>,
    /// JSON snapshot of the settings the item was admitted under. Written
    /// once at insert; NULL on rows that predate the column.
    pub settings: Option<String>,
    pub version: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            source_type: row.get("source_type")?,
            source_ref: row.get("source_ref")?,
            title: row.get("title")?,
            content: row.get("content")?,
            current_stage: row.get("current_stage")?,
            status: row.get("status")?,
            stage_history: row.get("stage_history")?,
            context: row.get("context")?,
            error_stage: row.get("error_stage")?,
            error_message: row.get("error_message")?,
            failure_kind: row.get("failure_kind")?,
            retry_count: row.get("retry_count")?,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            feedback: row.get("feedback")?,
            settings: row.get("settings")?,
            version: row.get("version")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for item listing.
#[derive(Debug, Default, Clone)]
pub struct ItemFilter {
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new item row.
pub fn insert(db: &Database, item: &ItemRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO items (id, user_id, source_type, source_ref, title, content,
             current_stage, status, stage_history, context, error_stage, error_message,
             failure_kind, retry_count, cancel_requested, feedback, settings, version,
             started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
             ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                item.id,
                item.user_id,
                item.source_type,
                item.source_ref,
                item.title,
                item.content,
                item.current_stage,
                item.status,
                item.stage_history,
                item.context,
                item.error_stage,
                item.error_message,
                item.failure_kind,
                item.retry_count,
                item.cancel_requested as i64,
                item.feedback,
                item.settings,
                item.version,
                item.started_at,
                item.completed_at,
                item.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Writes `item` if and only if the stored version still equals
/// `item.version`. The stored version is bumped by one on success.
///
/// `cancel_requested` is never overwritten from the caller's snapshot (a
/// cancel request may land between load and save); it is only cleared
/// when `reset_cancel` is set.
///
/// Returns `false` when another writer got there first.
pub fn update_versioned(
    db: &Database,
    item: &ItemRow,
    reset_cancel: bool,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE items SET current_stage=?2, status=?3, stage_history=?4, context=?5,
             error_stage=?6, error_message=?7, failure_kind=?8, retry_count=?9,
             feedback=?10, completed_at=?11, updated_at=?12,
             cancel_requested = CASE WHEN ?13 THEN 0 ELSE cancel_requested END,
             version = version + 1
             WHERE id=?1 AND version=?14",
            params![
                item.id,
                item.current_stage,
                item.status,
                item.stage_history,
                item.context,
                item.error_stage,
                item.error_message,
                item.failure_kind,
                item.retry_count,
                item.feedback,
                item.completed_at,
                item.updated_at,
                reset_cancel,
                item.version,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Finds an item by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM items WHERE id = ?1",
                params![id],
                ItemRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Queries items with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &ItemFilter) -> Result<(Vec<ItemRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            conditions.push(format!("user_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(user_id.clone()));
        }
        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM items {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(50) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM items {} ORDER BY started_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<ItemRow> = stmt
            .query_map(params_ref.as_slice(), ItemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Returns the user's items still in `processing`, oldest first.
pub fn find_processing(db: &Database, user_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM items WHERE user_id = ?1 AND status = 'processing'
             ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], ItemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns true if the user already has an item for this source reference.
pub fn source_ref_exists(
    db: &Database,
    user_id: &str,
    source_ref: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE user_id = ?1 AND source_ref = ?2",
            params![user_id, source_ref],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}

/// Counts the user's items grouped by status.
pub fn count_by_status(
    db: &Database,
    user_id: &str,
) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM items WHERE user_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map(params![user_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Flags a processing item for cancellation. Does not bump the version:
/// the engine observes the flag at its next stage boundary.
///
/// Returns `false` if the item is not processing.
pub fn request_cancel(db: &Database, id: &str, updated_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE items SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, updated_at],
        )?;
        Ok(changed == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_item(id: &str) -> ItemRow {
        ItemRow {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            source_type: "news".to_string(),
            source_ref: format!("https://news.example/{}", id),
            title: "Headline".to_string(),
            content: "Body".to_string(),
            current_stage: 1,
            status: "processing".to_string(),
            stage_history: "[]".to_string(),
            context: "{}".to_string(),
            error_stage: None,
            error_message: None,
            failure_kind: None,
            retry_count: 0,
            cancel_requested: false,
            feedback: None,
            settings: Some(r#"{"minScoreThreshold":65.0}"#.to_string()),
            version: 0,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_item("item-1")).unwrap();

        let found = find_by_id(&db, "item-1").unwrap().unwrap();
        assert_eq!(found.user_id, "user-1");
        assert_eq!(found.status, "processing");
        assert_eq!(found.version, 0);
        assert!(!found.cancel_requested);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_update_versioned_bumps_version() {
        let db = test_db();
        let mut item = sample_item("item-2");
        insert(&db, &item).unwrap();

        item.current_stage = 2;
        item.settings = Some(r#"{"minScoreThreshold":95.0}"#.to_string());
        assert!(update_versioned(&db, &item, false).unwrap());

        let found = find_by_id(&db, "item-2").unwrap().unwrap();
        assert_eq!(found.current_stage, 2);
        assert_eq!(found.version, 1);
        assert_eq!(
            found.settings.as_deref(),
            Some(r#"{"minScoreThreshold":65.0}"#)
        );
    }

    #[test]
    fn test_update_versioned_rejects_stale_writer() {
        let db = test_db();
        let item = sample_item("item-3");
        insert(&db, &item).unwrap();

        let mut first = item.clone();
        first.current_stage = 2;
        let mut second = item.clone();
        second.current_stage = 5;

        assert!(update_versioned(&db, &first, false).unwrap());
        assert!(!update_versioned(&db, &second, false).unwrap());

        let found = find_by_id(&db, "item-3").unwrap().unwrap();
        assert_eq!(found.current_stage, 2);
    }

    #[test]
    fn test_cancel_flag_survives_stale_snapshot_save() {
        let db = test_db();
        let mut item = sample_item("item-4");
        insert(&db, &item).unwrap();

        assert!(request_cancel(&db, "item-4", "2026-01-01T00:01:00Z").unwrap());

        item.current_stage = 2;
        assert!(update_versioned(&db, &item, false).unwrap());
        assert!(find_by_id(&db, "item-4").unwrap().unwrap().cancel_requested);

        let mut item = find_by_id(&db, "item-4").unwrap().unwrap();
        item.status = "failed".to_string();
        assert!(update_versioned(&db, &item, true).unwrap());
        assert!(!find_by_id(&db, "item-4").unwrap().unwrap().cancel_requested);
    }

    #[test]
    fn test_request_cancel_requires_processing() {
        let db = test_db();
        let mut item = sample_item("item-5");
        item.status = "completed".to_string();
        insert(&db, &item).unwrap();
        assert!(!request_cancel(&db, "item-5", "2026-01-01T00:00:00Z").unwrap());
    }

    #[test]
    fn test_query_filters_and_pagination() {
        let db = test_db();
        for i in 0..6 {
            let mut item = sample_item(&format!("q{}", i));
            item.started_at = format!("2026-01-{:02}T00:00:00Z", i + 1);
            if i % 2 == 0 {
                item.status = "failed".to_string();
            }
            insert(&db, &item).unwrap();
        }
        let mut other = sample_item("other");
        other.user_id = "user-2".to_string();
        insert(&db, &other).unwrap();

        let (rows, total) = query(
            &db,
            &ItemFilter {
                user_id: Some("user-1".to_string()),
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 6);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "q5");

        let (rows, total) = query(
            &db,
            &ItemFilter {
                user_id: Some("user-1".to_string()),
                status: Some("failed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 3);
        assert!(rows.iter().all(|r| r.status == "failed"));
    }

    #[test]
    fn test_find_processing_and_counts() {
        let db = test_db();
        insert(&db, &sample_item("p1")).unwrap();
        let mut done = sample_item("p2");
        done.status = "completed".to_string();
        insert(&db, &done).unwrap();

        let processing = find_processing(&db, "user-1").unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, "p1");

        let counts = count_by_status(&db, "user-1").unwrap();
        assert_eq!(
            counts,
            vec![("completed".to_string(), 1), ("processing".to_string(), 1)]
        );
    }

    #[test]
    fn test_source_ref_exists() {
        let db = test_db();
        insert(&db, &sample_item("s1")).unwrap();
        assert!(source_ref_exists(&db, "user-1", "https://news.example/s1").unwrap());
        assert!(!source_ref_exists(&db, "user-2", "https://news.example/s1").unwrap());
    }
}
