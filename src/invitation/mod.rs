mod invitation_service;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::Invitation;

pub use invitation_service::InvitationService;

/// Soft cap on concurrent pending invitations per company.
pub const MAX_PENDING_PER_COMPANY: i64 = 50;

/// Projection of an invitation row returned to callers. Never includes the
/// capability token; that travels only through the out-of-band link.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvitationDto {
    pub invitation_id: Uuid,
    pub email: String,
    pub status: String,
    pub role_ids: Vec<i32>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl From<Invitation> for InvitationDto {
    fn from(inv: Invitation) -> Self {
        Self {
            invitation_id: inv.invitation_id,
            email: inv.email,
            status: inv.status,
            role_ids: inv.role_ids,
            expires_at: inv.expires_at,
            created_at: inv.created_at,
        }
    }
}

/// Company display info handed to the registration UI after a token checks out.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvitationValidation {
    pub invitation_id: Uuid,
    pub company_id: i32,
    pub company_name: String,
    pub company_domain: String,
    pub email: String,
    pub role_ids: Vec<i32>,
    pub expires_at: OffsetDateTime,
}

/// Per-status invitation counts for a company.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvitationStats {
    pub pending: i64,
    pub accepted: i64,
    pub cancelled: i64,
    pub expired: i64,
    pub failed: i64,
}

/// Fields the invitee supplies when accepting an invitation.
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

/// Result of a successful invitation-based registration.
#[derive(Debug, Serialize)]
pub struct RegisteredUser {
    pub user_id: i32,
    pub company_id: i32,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub is_confirmed: bool,
    pub inherited_permissions: u64,
}
