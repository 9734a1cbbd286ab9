//! Settings repository: one JSON document per user.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// Returns the raw JSON settings document for a user, if one was saved.
pub fn get(db: &Database, user_id: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let data = conn
            .query_row(
                "SELECT data FROM settings WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(data)
    })
}

/// Inserts or replaces a user's settings document.
pub fn upsert(
    db: &Database,
    user_id: &str,
    data: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO settings (user_id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![user_id, data, updated_at],
        )?;
        Ok(())
    })
}

/// Lists user ids whose settings mark the pipeline as enabled.
pub fn enabled_users(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT user_id FROM settings
             WHERE json_extract(data, '$.enabled') = 1
             ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing() {
        let db = Database::open_in_memory().unwrap();
        assert!(get(&db, "u1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, "u1", r#"{"enabled":false}"#, "2026-01-01T00:00:00Z").unwrap();
        upsert(&db, "u1", r#"{"enabled":true}"#, "2026-01-02T00:00:00Z").unwrap();
        assert_eq!(get(&db, "u1").unwrap().unwrap(), r#"{"enabled":true}"#);
    }

    #[test]
    fn test_enabled_users() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, "a", r#"{"enabled":true}"#, "2026-01-01T00:00:00Z").unwrap();
        upsert(&db, "b", r#"{"enabled":false}"#, "2026-01-01T00:00:00Z").unwrap();
        upsert(&db, "c", r#"{"enabled":true}"#, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(enabled_users(&db).unwrap(), vec!["a", "c"]);
    }
}
