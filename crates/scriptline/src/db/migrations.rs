//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. ALTER TABLE ADD COLUMN migrations are handled
//! conditionally to support idempotent execution.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN; skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_items_table",
        sql: include_str!("sql/001_create_items.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_events_table",
        sql: include_str!("sql/002_create_events.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_settings_table",
        sql: include_str!("sql/003_create_settings.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_idempotency_records_table",
        sql: include_str!("sql/004_create_idempotency_records.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "create_usage_counters_table",
        sql: include_str!("sql/005_create_usage_counters.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 6,
        description: "create_gate_thresholds_table",
        sql: include_str!("sql/006_create_gate_thresholds.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 7,
        description: "add_feedback_to_items",
        sql: include_str!("sql/007_add_feedback_to_items.sql"),
        kind: MigrationKind::AddColumn {
            table: "items",
            column: "feedback",
        },
    },
    Migration {
        version: 8,
        description: "add_settings_to_items",
        sql: include_str!("sql/008_add_settings_to_items.sql"),
        kind: MigrationKind::AddColumn {
            table: "items",
            column: "settings",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (condition not met)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
