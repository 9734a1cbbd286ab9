//! Item store: typed access to the `items` table with optimistic versioning.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::item_repo::{self, ItemFilter, ItemRow};
use crate::db::{Database, DatabaseError};

use crate::settings::ItemSettings;

use super::{FailureKind, Feedback, Item, ItemStatus, SourceType};

#[derive(Error, Debug)]
pub enum ItemStoreError {
    /// Another writer saved the item since it was loaded.
    #[error("Item '{item_id}' was modified concurrently")]
    Conflict { item_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_row(item: &Item) -> Result<ItemRow, DatabaseError> {
    let stage_history =
        serde_json::to_string(&item.stage_history).map_err(|source| DatabaseError::Json {
            column: "stage_history",
            source,
        })?;
    let context = serde_json::to_string(&item.context).map_err(|source| DatabaseError::Json {
        column: "context",
        source,
    })?;
    let feedback = item
        .feedback
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|source| DatabaseError::Json {
            column: "feedback",
            source,
        })?;

    let settings = serde_json::to_string(&item.settings).map_err(|source| DatabaseError::Json {
        column: "settings",
        source,
    })?;

    Ok(ItemRow {
        id: item.id.clone(),
        user_id: item.user_id.clone(),
        source_type: item.source_type.as_str().to_string(),
        source_ref: item.source_ref.clone(),
        title: item.title.clone(),
        content: item.content.clone(),
        current_stage: i64::from(item.current_stage),
        status: item.status.as_str().to_string(),
        stage_history,
        context,
        error_stage: item.error_stage.map(i64::from),
        error_message: item.error_message.clone(),
        failure_kind: item.failure_kind.map(|k| k.as_str().to_string()),
        retry_count: i64::from(item.retry_count),
        cancel_requested: item.cancel_requested,
        feedback,
        settings: Some(settings),
        version: item.version,
        started_at: format_timestamp(item.started_at),
        completed_at: item.completed_at.map(format_timestamp),
        updated_at: format_timestamp(item.updated_at),
    })
}

fn from_row(row: ItemRow) -> Result<Item, DatabaseError> {
    let status = ItemStatus::parse(&row.status).ok_or_else(|| DatabaseError::InvalidValue {
        column: "status",
        value: row.status.clone(),
    })?;
    let source_type =
        SourceType::parse(&row.source_type).ok_or_else(|| DatabaseError::InvalidValue {
            column: "source_type",
            value: row.source_type.clone(),
        })?;
    let failure_kind = match row.failure_kind.as_deref() {
        None => None,
        Some(s) => Some(
            FailureKind::parse(s).ok_or_else(|| DatabaseError::InvalidValue {
                column: "failure_kind",
                value: s.to_string(),
            })?,
        ),
    };
    let stage_history =
        serde_json::from_str(&row.stage_history).map_err(|source| DatabaseError::Json {
            column: "stage_history",
            source,
        })?;
    let context = serde_json::from_str(&row.context).map_err(|source| DatabaseError::Json {
        column: "context",
        source,
    })?;
    let feedback: Option<Feedback> = row
        .feedback
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|source| DatabaseError::Json {
            column: "feedback",
            source,
        })?;
    let settings: ItemSettings = match row.settings.as_deref() {
        Some(json) => serde_json::from_str(json).map_err(|source| DatabaseError::Json {
            column: "settings",
            source,
        })?,
        None => ItemSettings::default(),
    };
    let current_stage =
        u8::try_from(row.current_stage).map_err(|_| DatabaseError::InvalidValue {
            column: "current_stage",
            value: row.current_stage.to_string(),
        })?;

    Ok(Item {
        started_at: parse_timestamp(&row.started_at),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
        updated_at: parse_timestamp(&row.updated_at),
        id: row.id,
        user_id: row.user_id,
        source_type,
        source_ref: row.source_ref,
        title: row.title,
        content: row.content,
        current_stage,
        status,
        stage_history,
        context,
        settings,
        error_stage: row.error_stage.and_then(|s| u8::try_from(s).ok()),
        error_message: row.error_message,
        failure_kind,
        retry_count: u32::try_from(row.retry_count).unwrap_or(0),
        cancel_requested: row.cancel_requested,
        feedback,
        version: row.version,
    })
}

// ─── ItemStore ──────────────────────────────────────────────────────────────

/// Counts of a user's items by status.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Clone)]
pub struct ItemStore {
    db: Database,
}

impl ItemStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, item: &Item) -> Result<(), ItemStoreError> {
        item_repo::insert(&self.db, &to_row(item)?)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Item>, ItemStoreError> {
        match item_repo::find_by_id(&self.db, id)? {
            Some(row) => Ok(Some(from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Persists `item` if nobody else saved it since it was loaded, then
    /// advances `item.version` to match the stored row.
    pub fn save(&self, item: &mut Item) -> Result<(), ItemStoreError> {
        self.write(item, false)
    }

    /// Like [`save`](Self::save), but also clears a pending cancel request.
    pub fn save_clearing_cancel(&self, item: &mut Item) -> Result<(), ItemStoreError> {
        self.write(item, true)
    }

    fn write(&self, item: &mut Item, reset_cancel: bool) -> Result<(), ItemStoreError> {
        let row = to_row(item)?;
        if !item_repo::update_versioned(&self.db, &row, reset_cancel)? {
            return Err(ItemStoreError::Conflict {
                item_id: item.id.clone(),
            });
        }
        item.version += 1;
        if reset_cancel {
            item.cancel_requested = false;
        }
        Ok(())
    }

    /// The user's items, newest first.
    pub fn list(
        &self,
        user_id: &str,
        status: Option<ItemStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<Item>, u64), ItemStoreError> {
        let filter = ItemFilter {
            user_id: Some(user_id.to_string()),
            status: status.map(|s| s.as_str().to_string()),
            limit: Some(limit),
            offset: Some(offset),
        };
        let (rows, total) = item_repo::query(&self.db, &filter)?;
        let items = rows
            .into_iter()
            .map(from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total))
    }

    /// Items left in `processing`, oldest first.
    pub fn find_processing(&self, user_id: &str) -> Result<Vec<Item>, ItemStoreError> {
        let rows = item_repo::find_processing(&self.db, user_id)?;
        Ok(rows
            .into_iter()
            .map(from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn source_ref_exists(&self, user_id: &str, source_ref: &str) -> Result<bool, ItemStoreError> {
        Ok(item_repo::source_ref_exists(&self.db, user_id, source_ref)?)
    }

    /// Flags a processing item for cancellation at its next stage boundary.
    /// Returns false when the item is not processing.
    pub fn request_cancel(&self, id: &str) -> Result<bool, ItemStoreError> {
        Ok(item_repo::request_cancel(
            &self.db,
            id,
            &format_timestamp(Utc::now()),
        )?)
    }

    pub fn status_counts(&self, user_id: &str) -> Result<StatusCounts, ItemStoreError> {
        let mut counts = StatusCounts::default();
        for (status, n) in item_repo::count_by_status(&self.db, user_id)? {
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Processing) => counts.processing = n,
                Some(ItemStatus::Completed) => counts.completed = n,
                Some(ItemStatus::Failed) => counts.failed = n,
                Some(ItemStatus::Cancelled) => counts.cancelled = n,
                None => log::warn!("Ignoring unknown item status '{}' in counts", status),
            }
        }
        Ok(counts)
    }
}
