//! HTTP request handlers for the REST API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use scriptline::budget::UsageSnapshot;
use scriptline::item::{Item, ItemProgress, ItemStatus, StatusCounts};
use scriptline::settings::Settings;
use scriptline::sources::Candidate;
use scriptline::worker::TriggerOutcome;

use super::{ApiError, UserId};
use crate::state::AppState;

const DEFAULT_PAGE: u64 = 50;
const MAX_PAGE: u64 = 200;

/// Build all REST routes.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/trigger", post(trigger))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/candidates", post(add_candidates))
        .route("/items", get(list_items))
        .route("/items/{id}", get(get_item))
        .route("/items/{id}/progress", get(get_progress))
        .route("/items/{id}/retry", post(retry_item))
        .route("/items/{id}/cancel", post(cancel_item))
        .route("/items/{id}/feedback", post(record_feedback))
        .route("/stats", get(stats))
        .route("/health", get(health_check))
}

async fn trigger(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let outcome = state.orchestrator.trigger(&user).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn get_settings(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<Settings>, ApiError> {
    Ok(Json(state.engine().settings().get(&user)?))
}

async fn put_settings(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
    state.engine().settings().put(&user, &settings)?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
struct CandidateBatch {
    candidates: Vec<Candidate>,
}

async fn add_candidates(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(batch): Json<CandidateBatch>,
) -> (StatusCode, Json<serde_json::Value>) {
    let accepted = batch.candidates.len();
    state.candidates.extend(&user, batch.candidates);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": accepted })),
    )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u64>,
    offset: Option<u64>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemList {
    items: Vec<Item>,
    total: u64,
}

async fn list_items(
    State(state): State<AppState>,
    UserId(user): UserId,
    Query(query): Query<ListQuery>,
) -> Result<Json<ItemList>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(ItemStatus::parse(s).ok_or_else(|| {
            ApiError::bad_request("invalid_query", format!("Unknown status '{}'", s))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let (items, total) = state
        .engine()
        .items()
        .list(&user, status, limit, query.offset.unwrap_or(0))?;
    Ok(Json(ItemList { items, total }))
}

/// Loads an item the caller owns. Other users' items read as missing.
fn owned_item(state: &AppState, user: &str, id: &str) -> Result<Item, ApiError> {
    state
        .engine()
        .items()
        .get(id)?
        .filter(|item| item.user_id == user)
        .ok_or_else(|| ApiError::not_found(format!("Item '{}' not found", id)))
}

async fn get_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<Item>, ApiError> {
    Ok(Json(owned_item(&state, &user, &id)?))
}

async fn get_progress(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<ItemProgress>, ApiError> {
    let item = owned_item(&state, &user, &id)?;
    Ok(Json(ItemProgress::from_item(&item, Utc::now())))
}

async fn retry_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    owned_item(&state, &user, &id)?;
    let item = state.orchestrator.retry(&id)?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

async fn cancel_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    owned_item(&state, &user, &id)?;
    let item = state.engine().cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    approved: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackResponse {
    item_id: String,
    approved: bool,
    effective_threshold: f64,
}

async fn record_feedback(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    owned_item(&state, &user, &id)?;
    let outcome = state.engine().record_feedback(&id, request.approved)?;
    Ok(Json(FeedbackResponse {
        item_id: outcome.item.id,
        approved: request.approved,
        effective_threshold: outcome.threshold,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    usage: UsageSnapshot,
    items: StatusCounts,
    effective_threshold: f64,
    processing: bool,
}

async fn stats(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<Stats>, ApiError> {
    let engine = state.engine();
    let settings = engine.settings().get(&user)?;
    Ok(Json(Stats {
        usage: engine.budget().usage(&user, &settings)?,
        items: engine
            .items()
            .status_counts(&user)?,
        effective_threshold: engine
            .thresholds()
            .effective(&user, settings.min_score_threshold)?,
        processing: state.orchestrator.is_processing(&user),
    }))
}

/// Server start time, set once at process start.
pub static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Returns basic health status, version, and uptime.
async fn health_check() -> Json<serde_json::Value> {
    let start = START_TIME.get_or_init(std::time::Instant::now);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": start.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use http_body_util::BodyExt;
    use scriptline::agents::{AgentError, AgentRequest, AgentResponse, ContentAgent};
    use scriptline::config::AppConfig;
    use scriptline::db::Database;
    use scriptline::pipeline::StageId;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::api::build_router;
    use crate::state::AppState;

    /// Scores every item 80 and writes a fixed script.
    struct CannedAgent;

    #[async_trait]
    impl ContentAgent for CannedAgent {
        async fn run(
            &self,
            stage: StageId,
            _request: &AgentRequest,
        ) -> Result<AgentResponse, AgentError> {
            let data = match stage {
                StageId::Scorer => json!({"score": 80, "confidence": 0.9}),
                StageId::Writer => json!({"script": "Tonight: chips."}),
                _ => json!({"ok": true}),
            };
            Ok(AgentResponse {
                data,
                cost_cents: Some(1),
            })
        }
    }

    fn test_state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        AppState::new(&AppConfig::default(), db, Arc::new(CannedAgent))
    }

    async fn send(
        state: &AppState,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        build_router(state.clone(), &[]).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn enable(state: &AppState, user: &str, extra: Value) {
        let mut settings = json!({"enabled": true});
        if let (Some(target), Some(extra)) = (settings.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        let response = send(state, "PUT", "/settings", Some(user), Some(settings)).await;
        assert_eq!(response.status(), 200);
    }

    async fn add_candidate(state: &AppState, user: &str, source_ref: &str) {
        let candidate = json!({
            "sourceType": "news",
            "sourceRef": source_ref,
            "title": "Chip exports tightened",
            "body": "New rules announced today.",
            "publishedAt": chrono::Utc::now().to_rfc3339(),
        });
        let response = send(
            state,
            "POST",
            "/candidates",
            Some(user),
            Some(json!({"candidates": [candidate]})),
        )
        .await;
        assert_eq!(response.status(), 202);
    }

    async fn wait_for_status(state: &AppState, user: &str, id: &str, status: &str) -> Value {
        for _ in 0..100 {
            let item = json_body(send(state, "GET", &format!("/items/{}", id), Some(user), None).await).await;
            if item["status"] == status {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("item {} never reached {}", id, status);
    }

    async fn wait_idle(state: &AppState, user: &str) {
        for _ in 0..100 {
            if !state.orchestrator.is_processing(user) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker for {} never went idle", user);
    }

    #[tokio::test]
    async fn test_missing_user_header() {
        let state = test_state();
        let response = send(&state, "GET", "/settings", None, None).await;
        assert_eq!(response.status(), 400);
        let body = json_body(response).await;
        assert_eq!(body["code"], "missing_user");
    }

    #[tokio::test]
    async fn test_health_needs_no_user() {
        let state = test_state();
        let response = send(&state, "GET", "/health", None, None).await;
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_validation() {
        let state = test_state();
        let defaults = json_body(send(&state, "GET", "/settings", Some("u1"), None).await).await;
        assert_eq!(defaults["enabled"], false);
        assert_eq!(defaults["minScoreThreshold"], 65.0);

        enable(&state, "u1", json!({"dailyItemLimit": 2})).await;
        let updated = json_body(send(&state, "GET", "/settings", Some("u1"), None).await).await;
        assert_eq!(updated["dailyItemLimit"], 2);

        let bad = send(
            &state,
            "PUT",
            "/settings",
            Some("u1"),
            Some(json!({"minScoreThreshold": 150})),
        )
        .await;
        assert_eq!(bad.status(), 400);
        assert_eq!(json_body(bad).await["code"], "invalid_settings");
    }

    #[tokio::test]
    async fn test_trigger_disabled_is_forbidden() {
        let state = test_state();
        let response = send(&state, "POST", "/trigger", Some("u1"), None).await;
        assert_eq!(response.status(), 403);
        assert_eq!(json_body(response).await["code"], "pipeline_disabled");
    }

    #[tokio::test]
    async fn test_trigger_runs_item_to_completion() {
        let state = test_state();
        enable(&state, "u1", json!({})).await;
        add_candidate(&state, "u1", "https://news/1").await;

        let response = send(&state, "POST", "/trigger", Some("u1"), None).await;
        assert_eq!(response.status(), 202);
        let outcome = json_body(response).await;
        let id = outcome["admitted"][0].as_str().unwrap().to_string();

        let item = wait_for_status(&state, "u1", &id, "completed").await;
        assert_eq!(item["stageHistory"].as_array().unwrap().len(), 9);

        let progress = json_body(
            send(&state, "GET", &format!("/items/{}/progress", id), Some("u1"), None).await,
        )
        .await;
        assert_eq!(progress["progressPercent"], 100.0);

        let list = json_body(send(&state, "GET", "/items?limit=10", Some("u1"), None).await).await;
        assert_eq!(list["total"], 1);

        let stats = json_body(send(&state, "GET", "/stats", Some("u1"), None).await).await;
        assert_eq!(stats["usage"]["itemsToday"], 1);
        assert_eq!(stats["usage"]["monthSpendCents"], 7);
        assert_eq!(stats["items"]["completed"], 1);

        let feedback = send(
            &state,
            "POST",
            &format!("/items/{}/feedback", id),
            Some("u1"),
            Some(json!({"approved": true})),
        )
        .await;
        assert_eq!(feedback.status(), 200);
        let again = send(
            &state,
            "POST",
            &format!("/items/{}/feedback", id),
            Some("u1"),
            Some(json!({"approved": true})),
        )
        .await;
        assert_eq!(again.status(), 409);
    }

    #[tokio::test]
    async fn test_daily_limit_is_too_many_requests() {
        let state = test_state();
        enable(&state, "u1", json!({"dailyItemLimit": 1})).await;
        add_candidate(&state, "u1", "https://news/1").await;
        add_candidate(&state, "u1", "https://news/2").await;

        let first = send(&state, "POST", "/trigger", Some("u1"), None).await;
        assert_eq!(first.status(), 202);
        let id = json_body(first).await["admitted"][0]
            .as_str()
            .unwrap()
            .to_string();
        wait_for_status(&state, "u1", &id, "completed").await;
        wait_idle(&state, "u1").await;

        let second = send(&state, "POST", "/trigger", Some("u1"), None).await;
        assert_eq!(second.status(), 429);
        assert_eq!(json_body(second).await["code"], "daily_limit_reached");
    }

    #[tokio::test]
    async fn test_other_users_items_are_not_found() {
        let state = test_state();
        enable(&state, "u1", json!({})).await;
        add_candidate(&state, "u1", "https://news/1").await;
        let outcome = json_body(send(&state, "POST", "/trigger", Some("u1"), None).await).await;
        let id = outcome["admitted"][0].as_str().unwrap().to_string();

        let response = send(&state, "GET", &format!("/items/{}", id), Some("u2"), None).await;
        assert_eq!(response.status(), 404);
        let response = send(&state, "POST", &format!("/items/{}/retry", id), Some("u2"), None).await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_retry_on_completed_item_is_invalid_state() {
        let state = test_state();
        enable(&state, "u1", json!({})).await;
        add_candidate(&state, "u1", "https://news/1").await;
        let outcome = json_body(send(&state, "POST", "/trigger", Some("u1"), None).await).await;
        let id = outcome["admitted"][0].as_str().unwrap().to_string();
        wait_for_status(&state, "u1", &id, "completed").await;

        let response = send(&state, "POST", &format!("/items/{}/retry", id), Some("u1"), None).await;
        assert_eq!(response.status(), 409);
        assert_eq!(json_body(response).await["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let state = test_state();
        let response = send(&state, "GET", "/items?status=bogus", Some("u1"), None).await;
        assert_eq!(response.status(), 400);
    }
}
