//! HTTP API for the pipeline: trigger, settings, items, events, stats.
//!
//! Every route except `/health` acts on behalf of the user named in the
//! `X-User-Id` header.

pub mod error;
pub mod events;
pub mod handlers;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use error::ApiError;

pub const USER_HEADER: &str = "x-user-id";

/// The calling user, from the `X-User-Id` header.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| UserId(s.to_string()))
            .ok_or_else(ApiError::missing_user)
    }
}

/// Build the API router with all routes.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .merge(handlers::api_routes())
        .merge(events::event_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
