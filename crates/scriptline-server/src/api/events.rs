//! Live event stream and durable history.
//!
//! `GET /events` subscribes before reading the backlog, pages through the
//! log until it is drained, then drops live events whose id was already
//! sent, so a reconnecting client sees each event once and in order.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::Deserialize;

use scriptline::broadcast::{EventSubscription, PipelineEvent, MAX_HISTORY};
use scriptline::EventBus;

use super::{ApiError, UserId};
use crate::state::AppState;

const DEFAULT_HISTORY: u64 = 100;

pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(stream_events))
        .route("/events/history", get(event_history))
}

fn to_sse(event: &PipelineEvent) -> Result<Event, Infallible> {
    Ok(Event::default()
        .id(event.id.to_string())
        .event(event.event_type.as_str())
        .data(serde_json::to_string(event).unwrap_or_default()))
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// One client's position: logged events past `last` first, then live.
struct Feed {
    events: EventBus,
    user: String,
    subscription: EventSubscription,
    pending: VecDeque<PipelineEvent>,
    /// Set while the log may still hold unread events past `last`.
    backlog: bool,
    last: i64,
}

impl Feed {
    fn push_page(&mut self, page: Vec<PipelineEvent>) {
        self.backlog = page.len() as u64 >= MAX_HISTORY;
        self.pending.extend(page);
    }

    fn fill(&mut self) {
        match self.events.history_after(&self.user, self.last) {
            Ok(page) => self.push_page(page),
            Err(e) => {
                tracing::warn!(user_id = %self.user, "Failed to read event backlog: {}", e);
                self.backlog = false;
            }
        }
    }

    async fn next(&mut self) -> Option<PipelineEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.last = event.id;
                return Some(event);
            }
            if self.backlog {
                self.fill();
                continue;
            }
            let event = self.subscription.recv().await?;
            if event.id > self.last {
                self.last = event.id;
                return Some(event);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    after: Option<i64>,
}

async fn stream_events(
    State(state): State<AppState>,
    UserId(user): UserId,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.engine().events().clone();
    let subscription = events.subscribe(&user);

    let after = query.after.or_else(|| last_event_id(&headers));
    let mut feed = Feed {
        user: user.clone(),
        subscription,
        pending: VecDeque::new(),
        backlog: false,
        last: after.unwrap_or(0),
        events,
    };
    if let Some(id) = after {
        let page = feed.events.history_after(&user, id)?;
        feed.push_page(page);
    }
    tracing::debug!(user_id = %user, backlog = feed.pending.len(), "Event stream opened");

    let body = stream::unfold(feed, |mut feed| async move {
        let event = feed.next().await?;
        Some((to_sse(&event), feed))
    });

    Ok(Sse::new(body).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u64>,
}

/// The newest `limit` events, oldest first.
async fn event_history(
    State(state): State<AppState>,
    UserId(user): UserId,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PipelineEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY);
    Ok(Json(state.engine().events().history(&user, limit)?))
}
