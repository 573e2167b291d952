use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::ServiceError;

/// Uniform response envelope: every endpoint returns
/// `{ success, message, data }`.
#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    pub fn ok_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiEnvelope<()> {
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Response-side wrapper for a ServiceError.
///
/// Business-rule failures (Conflict) come back as HTTP 200 with
/// `success=false`, by convention; non-200 codes are reserved for auth,
/// validation, missing entities, and unexpected failures.
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ServiceError::Conflict(msg) => (StatusCode::OK, msg.clone()),
            ServiceError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServiceError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServiceError::Infrastructure(e) => {
                error!("Unhandled infrastructure error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred.".to_string(),
                )
            }
        };

        (status, Json(ApiEnvelope::fail(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let envelope = ApiEnvelope::ok_message("Invitation sent", 42);
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            "{\"success\":true,\"message\":\"Invitation sent\",\"data\":42}"
        );
    }

    #[test]
    fn test_conflict_maps_to_http_200() {
        let response =
            ApiError(ServiceError::Conflict("User limit exceeded.".into())).into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_forbidden_maps_to_http_403() {
        let response =
            ApiError(ServiceError::Forbidden("cross-tenant access".into())).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_infrastructure_hides_detail() {
        let response =
            ApiError(ServiceError::Infrastructure(sqlx::Error::PoolClosed)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
