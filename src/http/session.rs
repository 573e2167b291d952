use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{LoginOutcome, SessionDto};

use super::envelope::{ApiEnvelope, ApiError};
use super::extract::CurrentUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub session_ids: Vec<Uuid>,
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiEnvelope<LoginOutcome>>, ApiError> {
    let device = req.device.or_else(|| user_agent(&headers));
    let outcome = state
        .sessions
        .login(&req.email, &req.password, device, client_ip(&headers))
        .await?;
    Ok(Json(ApiEnvelope::ok_message("Login successful.", outcome)))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiEnvelope<LoginOutcome>>, ApiError> {
    let outcome = state.sessions.refresh(&req.refresh_token).await?;
    Ok(Json(ApiEnvelope::ok_message("Session refreshed.", outcome)))
}

pub async fn logout(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.sessions.logout(&ctx).await?;
    Ok(Json(ApiEnvelope::ok_message("Logged out.", ())))
}

pub async fn logout_all(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> Result<Json<ApiEnvelope<u64>>, ApiError> {
    let revoked = state.sessions.logout_all(&ctx).await?;
    Ok(Json(ApiEnvelope::ok_message("All sessions revoked.", revoked)))
}

pub async fn revoke(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<ApiEnvelope<u64>>, ApiError> {
    let revoked = state.sessions.revoke_sessions(&ctx, &req.session_ids).await?;
    Ok(Json(ApiEnvelope::ok_message("Sessions revoked.", revoked)))
}

pub async fn active_sessions(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> Result<Json<ApiEnvelope<Vec<SessionDto>>>, ApiError> {
    let sessions = state.sessions.list_own_active(&ctx).await?;
    Ok(Json(ApiEnvelope::ok(sessions)))
}

pub async fn company_sessions(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> Result<Json<ApiEnvelope<Vec<SessionDto>>>, ApiError> {
    let sessions = state.sessions.list_company(&ctx).await?;
    Ok(Json(ApiEnvelope::ok(sessions)))
}
