use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::ServiceError;
use crate::model::AuthContext;

use super::envelope::ApiError;
use super::AppState;

/// Extracts and verifies the bearer access token, then checks the session row
/// it names is still live. Revoking a session takes effect on the next request
/// even while the token itself is unexpired.
pub struct CurrentUser(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(ServiceError::Forbidden(
                    "Missing authorization header.".to_string(),
                ))
            })?;

        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiError(ServiceError::Forbidden(
                "Malformed authorization header.".to_string(),
            ))
        })?;

        let ctx = state
            .tokens
            .validate_access_token(token)
            .map_err(|r| ApiError(ServiceError::Forbidden(r.message().to_string())))?;

        let session_id = ctx.session_id.ok_or_else(|| {
            ApiError(ServiceError::Forbidden("The token is invalid.".to_string()))
        })?;

        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM session
                 WHERE session_id = $1 AND is_revoked = FALSE AND access_expires_at > NOW()
             )",
        )
        .bind(session_id)
        .fetch_one(&state.db_pool)
        .await
        .map_err(|e| ApiError(ServiceError::Infrastructure(e)))?;

        if !live {
            return Err(ApiError(ServiceError::Forbidden(
                "Session is revoked.".to_string(),
            )));
        }

        Ok(CurrentUser(ctx))
    }
}
