//! Durable event log with live fan-out.
//!
//! `emit` writes the event to the `events` table first and only then
//! pushes it to subscribers, so the log is the source of truth and live
//! delivery is best-effort. A slow subscriber lags the broadcast channel
//! and skips events; it never blocks the engine.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::db::event_repo::{self, EventRow};
use crate::db::{Database, DatabaseError};
use crate::pipeline::stage::StageId;

use super::pipeline_event::{EventData, EventType, NewEvent, PipelineEvent};

/// Upper bound on a single history or backfill read.
pub const MAX_HISTORY: u64 = 1_000;

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn from_row(row: EventRow) -> Option<PipelineEvent> {
    let Some(event_type) = EventType::parse(&row.event_type) else {
        log::warn!(
            "Skipping event {} with unknown type '{}'",
            row.id,
            row.event_type
        );
        return None;
    };
    let stage = row
        .stage
        .and_then(|s| u8::try_from(s).ok())
        .and_then(StageId::from_number);
    Some(PipelineEvent {
        id: row.id,
        event_type,
        timestamp: parse_timestamp(&row.created_at),
        data: EventData {
            stage: stage.map(StageId::number),
            stage_name: stage.map(|s| s.name().to_string()),
            message: row.message,
            progress: row.progress,
        },
        user_id: row.user_id,
        item_id: row.item_id,
    })
}

#[derive(Clone)]
pub struct EventBus {
    db: Database,
    sender: broadcast::Sender<PipelineEvent>,
    // Keeps id order and broadcast order identical.
    emit_lock: Arc<Mutex<()>>,
}

impl EventBus {
    pub fn new(db: Database, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            db,
            sender,
            emit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Appends the event to the log, then pushes it to live subscribers.
    pub fn emit(&self, event: NewEvent) -> Result<PipelineEvent, DatabaseError> {
        let _guard = self
            .emit_lock
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned)?;

        let now = Utc::now();
        let row = EventRow {
            id: 0,
            user_id: event.user_id.clone(),
            item_id: event.item_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            stage: event.stage.map(|s| i64::from(s.number())),
            message: event.message.clone(),
            progress: event.progress,
            created_at: now.to_rfc3339(),
        };
        let id = event_repo::insert(&self.db, &row)?;

        let persisted = PipelineEvent {
            id,
            event_type: event.event_type,
            user_id: event.user_id,
            item_id: event.item_id,
            timestamp: now,
            data: EventData {
                stage: event.stage.map(StageId::number),
                stage_name: event.stage.map(|s| s.name().to_string()),
                message: event.message,
                progress: event.progress,
            },
        };

        tracing::debug!(
            event_id = id,
            item_id = %persisted.item_id,
            event_type = %persisted.event_type,
            "Event emitted"
        );

        // No receivers is fine.
        let _ = self.sender.send(persisted.clone());
        Ok(persisted)
    }

    /// Live events for one user.
    pub fn subscribe(&self, user_id: &str) -> EventSubscription {
        EventSubscription {
            user_id: user_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }

    /// The user's most recent `limit` events, oldest first.
    pub fn history(&self, user_id: &str, limit: u64) -> Result<Vec<PipelineEvent>, DatabaseError> {
        let rows = event_repo::recent_for_user(&self.db, user_id, limit.min(MAX_HISTORY))?;
        Ok(rows.into_iter().filter_map(from_row).collect())
    }

    /// The user's events after `after_id`, oldest first.
    pub fn history_after(
        &self,
        user_id: &str,
        after_id: i64,
    ) -> Result<Vec<PipelineEvent>, DatabaseError> {
        let rows = event_repo::after_for_user(&self.db, user_id, after_id, MAX_HISTORY)?;
        Ok(rows.into_iter().filter_map(from_row).collect())
    }

    /// Every event recorded for one item, oldest first.
    pub fn for_item(&self, item_id: &str) -> Result<Vec<PipelineEvent>, DatabaseError> {
        let rows = event_repo::for_item(&self.db, item_id)?;
        Ok(rows.into_iter().filter_map(from_row).collect())
    }
}

/// A user-filtered view of the live channel.
pub struct EventSubscription {
    user_id: String,
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventSubscription {
    /// Waits for the next event for this user. Returns `None` once the bus
    /// is gone. Skipped events are logged and can be recovered from the log.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.user_id == self.user_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        skipped,
                        "Event subscriber lagged; events dropped from live feed"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
