use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use scriptline::budget::{BudgetError, DenialReason};
use scriptline::db::DatabaseError;
use scriptline::gate::ThresholdError;
use scriptline::item::ItemStoreError;
use scriptline::pipeline::EngineError;
use scriptline::worker::AdmissionError;
use scriptline::SettingsError;

/// JSON error body: `{ "error": message, "code": code }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn missing_user() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "missing_user",
            "X-User-Id header is required",
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", what)
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!("Request failed: {}", e);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<DenialReason> for ApiError {
    fn from(reason: DenialReason) -> Self {
        let status = match reason {
            DenialReason::DailyLimitReached | DenialReason::BudgetExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            DenialReason::AlreadyProcessing => StatusCode::CONFLICT,
            DenialReason::PipelineDisabled => StatusCode::FORBIDDEN,
        };
        Self::new(status, reason.code(), reason.message())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, "conflict", e.to_string())
            }
            EngineError::NotFound(_) => Self::not_found(e.to_string()),
            EngineError::InvalidState { .. } | EngineError::NoStage(_) => {
                Self::new(StatusCode::CONFLICT, "invalid_state", e.to_string())
            }
            EngineError::NotRetryable(_) => {
                Self::new(StatusCode::CONFLICT, "not_retryable", e.to_string())
            }
            EngineError::FeedbackAlreadyRecorded(_) => {
                Self::new(StatusCode::CONFLICT, "feedback_already_recorded", e.to_string())
            }
            EngineError::Settings(e) => e.into(),
            other => Self::internal(other),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Invalid { .. } | SettingsError::InvalidKeyword { .. } => {
                Self::bad_request("invalid_settings", e.to_string())
            }
            other => Self::internal(other),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Denied(reason) => reason.into(),
            AdmissionError::Settings(e) => e.into(),
            AdmissionError::Engine(e) => e.into(),
            other => Self::internal(other),
        }
    }
}

impl From<ItemStoreError> for ApiError {
    fn from(e: ItemStoreError) -> Self {
        EngineError::from(e).into()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::internal(e)
    }
}

impl From<BudgetError> for ApiError {
    fn from(e: BudgetError) -> Self {
        Self::internal(e)
    }
}

impl From<ThresholdError> for ApiError {
    fn from(e: ThresholdError) -> Self {
        Self::internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptline::item::ItemStatus;

    #[test]
    fn test_denials_map_to_statuses() {
        assert_eq!(
            ApiError::from(DenialReason::DailyLimitReached).status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(DenialReason::BudgetExceeded).code,
            "budget_exceeded"
        );
        assert_eq!(
            ApiError::from(DenialReason::AlreadyProcessing).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(DenialReason::PipelineDisabled).status,
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_engine_errors_map_to_statuses() {
        let conflict = ApiError::from(EngineError::Conflict {
            item_id: "i".into(),
        });
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, "conflict");

        let invalid = ApiError::from(EngineError::InvalidState {
            item_id: "i".into(),
            status: ItemStatus::Completed,
            expected: "failed",
        });
        assert_eq!(invalid.code, "invalid_state");

        assert_eq!(
            ApiError::from(EngineError::NotFound("i".into())).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_invalid_settings_is_bad_request() {
        let e = ApiError::from(SettingsError::Invalid {
            field: "minScoreThreshold",
            reason: "out of range".into(),
        });
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "invalid_settings");
    }
}
