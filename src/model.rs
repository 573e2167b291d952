use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub company_id: i32,
    pub name: String,
    pub domain: String,
    pub address: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomPlan {
    pub plan_id: i32,
    pub company_id: i32,
    pub user_limit: i32,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct TaxUser {
    pub user_id: i32,
    pub company_id: i32,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub is_owner: bool,
    pub is_confirmed: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: i32,
    pub name: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub permission_id: i32,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct CompanyPermission {
    pub company_permission_id: i32,
    pub user_id: i32,
    pub permission_code: String,
    pub is_granted: bool,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Invitation {
    pub invitation_id: Uuid,
    pub company_id: i32,
    pub inviter_id: i32,
    pub email: String,
    pub status: String,
    pub role_ids: Vec<i32>,
    pub expires_at: OffsetDateTime,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancelled_by: Option<i32>,
    pub cancel_reason: Option<String>,
    pub registered_user_id: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: i32,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: OffsetDateTime,
    pub refresh_expires_at: OffsetDateTime,
    pub is_revoked: bool,
    pub device: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Closed role taxonomy. Resolved once at role-creation time and stored on the
/// role row, instead of re-parsing display names on every query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoleCategory {
    Owner,
    Administrator,
    Member,
    Developer,
    Customer,
}

impl RoleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleCategory::Owner => "owner",
            RoleCategory::Administrator => "administrator",
            RoleCategory::Member => "member",
            RoleCategory::Developer => "developer",
            RoleCategory::Customer => "customer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(RoleCategory::Owner),
            "administrator" => Some(RoleCategory::Administrator),
            "member" => Some(RoleCategory::Member),
            "developer" => Some(RoleCategory::Developer),
            "customer" => Some(RoleCategory::Customer),
            _ => None,
        }
    }

    /// Categories that may never be handed out through an invitation.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            RoleCategory::Owner | RoleCategory::Administrator | RoleCategory::Developer
        )
    }

    /// Customer-only accounts log in through the client portal, not here.
    pub fn permits_portal_login(categories: &[RoleCategory]) -> bool {
        categories.is_empty() || categories.iter().any(|c| *c != RoleCategory::Customer)
    }
}

/// Invitation state machine. Pending is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Cancelled,
    Expired,
    Failed,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Cancelled => "cancelled",
            InvitationStatus::Expired => "expired",
            InvitationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvitationStatus::Pending),
            "accepted" => Some(InvitationStatus::Accepted),
            "cancelled" => Some(InvitationStatus::Cancelled),
            "expired" => Some(InvitationStatus::Expired),
            "failed" => Some(InvitationStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: InvitationStatus) -> bool {
        matches!(self, InvitationStatus::Pending) && next != InvitationStatus::Pending
    }
}

// Auth context for a request, decoded from the access token
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct AuthContext {
    pub user_id: i32,
    pub company_id: i32,
    pub session_id: Option<Uuid>,
    pub is_owner: bool,
    pub role_categories: Vec<RoleCategory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_category_round_trip() {
        for cat in [
            RoleCategory::Owner,
            RoleCategory::Administrator,
            RoleCategory::Member,
            RoleCategory::Developer,
            RoleCategory::Customer,
        ] {
            assert_eq!(RoleCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(RoleCategory::parse("Administrator"), None);
    }

    #[test]
    fn test_privileged_categories_excluded_from_invitations() {
        assert!(RoleCategory::Owner.is_privileged());
        assert!(RoleCategory::Administrator.is_privileged());
        assert!(RoleCategory::Developer.is_privileged());
        assert!(!RoleCategory::Member.is_privileged());
        assert!(!RoleCategory::Customer.is_privileged());
    }

    #[test]
    fn test_portal_login_rejects_customer_only_accounts() {
        assert!(!RoleCategory::permits_portal_login(&[RoleCategory::Customer]));
        assert!(RoleCategory::permits_portal_login(&[
            RoleCategory::Customer,
            RoleCategory::Member
        ]));
        assert!(RoleCategory::permits_portal_login(&[]));
    }

    #[test]
    fn test_invitation_state_machine_terminal_states() {
        let pending = InvitationStatus::Pending;
        assert!(pending.can_transition_to(InvitationStatus::Accepted));
        assert!(pending.can_transition_to(InvitationStatus::Cancelled));
        assert!(pending.can_transition_to(InvitationStatus::Expired));
        assert!(pending.can_transition_to(InvitationStatus::Failed));

        for terminal in [
            InvitationStatus::Accepted,
            InvitationStatus::Cancelled,
            InvitationStatus::Expired,
            InvitationStatus::Failed,
        ] {
            assert!(!terminal.can_transition_to(InvitationStatus::Pending));
            assert!(!terminal.can_transition_to(InvitationStatus::Cancelled));
        }
    }
}
