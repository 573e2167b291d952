use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::account::{CompanyRegistration, RegisteredCompany};
use crate::invitation::{
    InvitationDto, InvitationStats, InvitationValidation, RegisteredUser, RegistrationRequest,
};
use crate::error::ServiceError;
use crate::model::InvitationStatus;

use super::envelope::{ApiEnvelope, ApiError};
use super::extract::CurrentUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub email: String,
    #[serde(default)]
    pub role_ids: Vec<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterByInvitationRequest {
    pub token: String,
    #[serde(flatten)]
    pub registration: RegistrationRequest,
}

#[derive(Debug, Deserialize)]
pub struct CancelInvitationsRequest {
    pub invitation_ids: Vec<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvitationListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserTargetRequest {
    pub user_id: i32,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CompanyRegistration>,
) -> Result<Json<ApiEnvelope<RegisteredCompany>>, ApiError> {
    let registered = state.accounts.register_company(req).await?;
    Ok(Json(ApiEnvelope::ok_message(
        "Company registered. Please confirm your account.",
        registered,
    )))
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.accounts.confirm(&req.email, &req.token).await?;
    Ok(Json(ApiEnvelope::ok_message("Account confirmed.", ())))
}

pub async fn invite(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Json(req): Json<InviteRequest>,
) -> Result<Json<ApiEnvelope<InvitationDto>>, ApiError> {
    let invitation = state
        .invitations
        .send(&ctx, &req.email, &req.role_ids)
        .await?;
    Ok(Json(ApiEnvelope::ok_message("Invitation sent.", invitation)))
}

pub async fn validate_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiEnvelope<InvitationValidation>>, ApiError> {
    let validation = state.invitations.validate(&token).await?;
    Ok(Json(ApiEnvelope::ok(validation)))
}

pub async fn register_by_invitation(
    State(state): State<AppState>,
    Json(req): Json<RegisterByInvitationRequest>,
) -> Result<Json<ApiEnvelope<RegisteredUser>>, ApiError> {
    let registered = state
        .invitations
        .register_by_invitation(&req.token, req.registration)
        .await?;
    Ok(Json(ApiEnvelope::ok_message("Registration complete.", registered)))
}

pub async fn cancel_invitations(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Json(req): Json<CancelInvitationsRequest>,
) -> Result<Json<ApiEnvelope<u64>>, ApiError> {
    let cancelled = state
        .invitations
        .cancel(&ctx, &req.invitation_ids, req.reason)
        .await?;
    Ok(Json(ApiEnvelope::ok_message("Invitations cancelled.", cancelled)))
}

pub async fn list_invitations(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Query(query): Query<InvitationListQuery>,
) -> Result<Json<ApiEnvelope<Vec<InvitationDto>>>, ApiError> {
    let status = parse_status_filter(query.status.as_deref())?;
    let invitations = state.invitations.list(&ctx, status).await?;
    Ok(Json(ApiEnvelope::ok(invitations)))
}

/// An absent filter means all statuses; an unparseable one is an error, not a
/// silent full listing.
fn parse_status_filter(raw: Option<&str>) -> Result<Option<InvitationStatus>, ServiceError> {
    match raw {
        None => Ok(None),
        Some(s) => InvitationStatus::parse(s).map(Some).ok_or_else(|| {
            ServiceError::Validation(format!("Unknown invitation status: {}.", s))
        }),
    }
}

pub async fn invitation_stats(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> Result<Json<ApiEnvelope<InvitationStats>>, ApiError> {
    let stats = state.invitations.stats(&ctx).await?;
    Ok(Json(ApiEnvelope::ok(stats)))
}

pub async fn disable_user(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Json(req): Json<UserTargetRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.sessions.disable_user(&ctx, req.user_id).await?;
    Ok(Json(ApiEnvelope::ok_message("User disabled.", ())))
}

pub async fn enable_user(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Json(req): Json<UserTargetRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.sessions.enable_user(&ctx, req.user_id).await?;
    Ok(Json(ApiEnvelope::ok_message("User enabled.", ())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_filter_rejects_unknown_values() {
        assert_eq!(parse_status_filter(None).unwrap(), None);
        assert_eq!(
            parse_status_filter(Some("pending")).unwrap(),
            Some(InvitationStatus::Pending)
        );

        let err = parse_status_filter(Some("bogus")).unwrap_err();
        assert_eq!(err.to_string(), "Unknown invitation status: bogus.");
    }
}
