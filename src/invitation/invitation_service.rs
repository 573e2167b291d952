use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{hash_password, TokenService};
use crate::config::AppConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{self, DomainEvent, EventPublisher};
use crate::limits::LimitPolicy;
use crate::model::{
    AuthContext, Company, CustomPlan, Invitation, InvitationStatus, RoleCategory, TaxUser,
};
use crate::permission::PermissionInheritance;

use super::{
    InvitationDto, InvitationStats, InvitationValidation, RegisteredUser, RegistrationRequest,
    MAX_PENDING_PER_COMPANY,
};

/// Orchestrates the invitation state machine: send, validate,
/// accept-by-registration, cancel, and the expiry sweep. The persisted
/// invitation row is the source of truth; the signed token is a capability
/// referencing it.
pub struct InvitationService {
    db_pool: PgPool,
    tokens: Arc<TokenService>,
    config: AppConfig,
    publisher: Arc<dyn EventPublisher>,
}

impl InvitationService {
    pub fn new(
        db_pool: PgPool,
        tokens: Arc<TokenService>,
        config: AppConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            db_pool,
            tokens,
            config,
            publisher,
        }
    }

    /// Create and send an invitation. The actor must be an active owner or
    /// administrator of the company; the company must have an active plan with
    /// head room and at least one active owner.
    pub async fn send(
        &self,
        ctx: &AuthContext,
        email: &str,
        role_ids: &[i32],
    ) -> ServiceResult<InvitationDto> {
        let email = normalize_email(email)?;

        let actor = self.require_active_actor(ctx).await?;
        if !actor.is_owner
            && !ctx
                .role_categories
                .contains(&RoleCategory::Administrator)
        {
            return Err(ServiceError::Forbidden(
                "Only owners and administrators may send invitations.".to_string(),
            ));
        }

        let company = self.load_company(ctx.company_id).await?;
        self.require_active_owner(company.company_id).await?;

        LimitPolicy::check_company(&self.db_pool, company.company_id, false).await?;

        if self.email_registered(&email).await? {
            return Err(ServiceError::Conflict(
                "Email is already registered.".to_string(),
            ));
        }

        let pending_for_email: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invitation
             WHERE company_id = $1 AND email = $2 AND status = 'pending'",
        )
        .bind(company.company_id)
        .bind(&email)
        .fetch_one(&self.db_pool)
        .await?;
        if pending_for_email > 0 {
            return Err(ServiceError::Conflict(
                "A pending invitation already exists for this email.".to_string(),
            ));
        }

        let pending_total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invitation WHERE company_id = $1 AND status = 'pending'",
        )
        .bind(company.company_id)
        .fetch_one(&self.db_pool)
        .await?;
        if pending_total >= MAX_PENDING_PER_COMPANY {
            return Err(ServiceError::Conflict(format!(
                "Too many pending invitations for this company. Limit: {}.",
                MAX_PENDING_PER_COMPANY
            )));
        }

        self.validate_invitable_roles(role_ids).await?;

        let invitation_id = Uuid::new_v4();
        let (token, expires_at) = self
            .tokens
            .generate_invitation(invitation_id, company.company_id, &email, role_ids)
            .map_err(|e| {
                error!("Invitation token generation failed: {}", e);
                ServiceError::Validation("Could not create the invitation.".to_string())
            })?;

        let mut tx = self.db_pool.begin().await?;

        let invitation = sqlx::query_as::<_, Invitation>(
            "INSERT INTO invitation
                 (invitation_id, company_id, inviter_id, email, status, role_ids, expires_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'pending', $5, $6, NOW(), NOW())
             RETURNING *",
        )
        .bind(invitation_id)
        .bind(company.company_id)
        .bind(actor.user_id)
        .bind(&email)
        .bind(role_ids)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            // Unique partial index on pending rows closes the race between
            // two concurrent sends for the same email
            sqlx::Error::Database(ref db)
                if db.constraint() == Some("idx_invitation_pending_email") =>
            {
                ServiceError::Conflict(
                    "A pending invitation already exists for this email.".to_string(),
                )
            }
            e => ServiceError::Infrastructure(e),
        })?;

        events::stage(
            &mut tx,
            &DomainEvent::UserInvitationSentEvent {
                invitation_id,
                company_id: company.company_id,
                company_name: company.name.clone(),
                company_domain: company.domain.clone(),
                email: email.clone(),
                invitation_link: self.config.invitation_link(&email, &token),
                expires_at,
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(
            invitation_id = %invitation_id,
            company_id = company.company_id,
            inviter_id = actor.user_id,
            "Invitation sent"
        );
        Ok(invitation.into())
    }

    /// Pre-registration check: verifies the capability token, the row it
    /// points at, and the send-time preconditions that could have changed
    /// since.
    pub async fn validate(&self, token: &str) -> ServiceResult<InvitationValidation> {
        let (invitation, company) = self.checked_invitation(token).await?;

        let plan = LimitPolicy::load_plan(&self.db_pool, company.company_id).await?;
        if !plan.is_active {
            return Err(ServiceError::Conflict(
                "Company plan is inactive.".to_string(),
            ));
        }

        self.require_active_owner(company.company_id).await?;

        if self.email_registered(&invitation.email).await? {
            return Err(ServiceError::Conflict(
                "Email is already registered.".to_string(),
            ));
        }

        Ok(InvitationValidation {
            invitation_id: invitation.invitation_id,
            company_id: company.company_id,
            company_name: company.name,
            company_domain: company.domain,
            email: invitation.email,
            role_ids: invitation.role_ids,
            expires_at: invitation.expires_at,
        })
    }

    /// Consume the invitation: re-validate every send-time precondition inside
    /// one transaction, create the member active+confirmed, assign roles, run
    /// permission inheritance, and mark the row Accepted.
    pub async fn register_by_invitation(
        &self,
        token: &str,
        req: RegistrationRequest,
    ) -> ServiceResult<RegisteredUser> {
        let decoded = self
            .tokens
            .validate_invitation(token)
            .map_err(|r| ServiceError::Validation(r.message().to_string()))?;

        if req.password.len() < 8 {
            return Err(ServiceError::Validation(
                "Password must be at least 8 characters.".to_string(),
            ));
        }

        let password_hash = hash_password(&req.password)?;

        let mut tx = self.db_pool.begin().await?;

        let invitation = sqlx::query_as::<_, Invitation>(
            "SELECT * FROM invitation WHERE invitation_id = $1 FOR UPDATE",
        )
        .bind(decoded.invitation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::Validation("The link is invalid.".to_string()))?;

        let now = OffsetDateTime::now_utc();
        if invitation.status != InvitationStatus::Pending.as_str() {
            return Err(ServiceError::Conflict(
                "Invitation is no longer valid.".to_string(),
            ));
        }
        if invitation.expires_at <= now {
            return Err(ServiceError::Validation("The link has expired.".to_string()));
        }
        if invitation.email != decoded.email || invitation.company_id != decoded.company_id {
            warn!(
                invitation_id = %invitation.invitation_id,
                "Invitation token does not match its persisted row"
            );
            return Err(ServiceError::Validation("The link is invalid.".to_string()));
        }

        let company = sqlx::query_as::<_, Company>(
            "SELECT * FROM company WHERE company_id = $1",
        )
        .bind(invitation.company_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::not_found("Company"))?;

        let plan = sqlx::query_as::<_, CustomPlan>(
            "SELECT * FROM custom_plan WHERE company_id = $1",
        )
        .bind(company.company_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::not_found("Company plan"))?;

        // The company must still have an active owner at accept time; the
        // send-time check can be stale by now
        let active_owners: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tax_user
             WHERE company_id = $1 AND is_active = TRUE AND is_owner = TRUE",
        )
        .bind(company.company_id)
        .fetch_one(&mut *tx)
        .await?;
        if active_owners == 0 {
            return Err(ServiceError::Conflict(
                "Company has no active owner.".to_string(),
            ));
        }

        let active_users: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tax_user WHERE company_id = $1 AND is_active = TRUE",
        )
        .bind(company.company_id)
        .fetch_one(&mut *tx)
        .await?;
        LimitPolicy::check(&plan, active_users)?;

        let email_taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM tax_user WHERE email = $1)",
        )
        .bind(&invitation.email)
        .fetch_one(&mut *tx)
        .await?;
        if email_taken {
            return Err(ServiceError::Conflict(
                "Email is already registered.".to_string(),
            ));
        }

        // Invitation-based registration starts active and confirmed, unlike
        // self-registration which waits for the confirmation link.
        let user = sqlx::query_as::<_, TaxUser>(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name, phone,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, FALSE, TRUE, NOW(), NOW())
             RETURNING *",
        )
        .bind(company.company_id)
        .bind(&invitation.email)
        .bind(&password_hash)
        .bind(&req.first_name)
        .bind(&req.last_name)
        .bind(&req.phone)
        .fetch_one(&mut *tx)
        .await?;

        let role_ids = self
            .resolve_registration_roles(&mut tx, &invitation.role_ids)
            .await?;
        for role_id in &role_ids {
            sqlx::query(
                "INSERT INTO user_role (user_id, role_id, created_at)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (user_id, role_id) DO NOTHING",
            )
            .bind(user.user_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        }

        let inherited =
            PermissionInheritance::inherit(&mut tx, company.company_id, user.user_id).await?;

        sqlx::query(
            "UPDATE invitation
             SET status = 'accepted', registered_user_id = $1, updated_at = NOW()
             WHERE invitation_id = $2",
        )
        .bind(user.user_id)
        .bind(invitation.invitation_id)
        .execute(&mut *tx)
        .await?;

        events::stage(
            &mut tx,
            &DomainEvent::UserRegisteredEvent {
                user_id: user.user_id,
                company_id: company.company_id,
                company_name: company.name.clone(),
                company_domain: company.domain.clone(),
                email: user.email.clone(),
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(
            user_id = user.user_id,
            company_id = company.company_id,
            invitation_id = %invitation.invitation_id,
            "User registered by invitation"
        );

        Ok(RegisteredUser {
            user_id: user.user_id,
            company_id: company.company_id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: user.is_active,
            is_confirmed: user.is_confirmed,
            inherited_permissions: inherited,
        })
    }

    /// Cancel one or more pending invitations belonging to the actor's
    /// company. Rows already in a terminal state are skipped; if no row
    /// qualifies the call fails with a Conflict rather than a crash.
    pub async fn cancel(
        &self,
        ctx: &AuthContext,
        invitation_ids: &[Uuid],
        reason: Option<String>,
    ) -> ServiceResult<u64> {
        if invitation_ids.is_empty() {
            return Err(ServiceError::Validation(
                "At least one invitation id is required.".to_string(),
            ));
        }

        let actor = self.require_active_actor(ctx).await?;
        let company = self.load_company(ctx.company_id).await?;
        let reason = reason.unwrap_or_else(|| "Cancelled by company staff".to_string());

        let mut tx = self.db_pool.begin().await?;

        let cancellable: Vec<Invitation> = sqlx::query_as(
            "SELECT * FROM invitation
             WHERE invitation_id = ANY($1) AND company_id = $2 AND status = 'pending'
             FOR UPDATE",
        )
        .bind(invitation_ids)
        .bind(company.company_id)
        .fetch_all(&mut *tx)
        .await?;

        if cancellable.is_empty() {
            return Err(ServiceError::Conflict(
                "No valid invitations to cancel.".to_string(),
            ));
        }

        for invitation in &cancellable {
            sqlx::query(
                "UPDATE invitation
                 SET status = 'cancelled', cancelled_at = NOW(), cancelled_by = $1,
                     cancel_reason = $2, updated_at = NOW()
                 WHERE invitation_id = $3",
            )
            .bind(actor.user_id)
            .bind(&reason)
            .bind(invitation.invitation_id)
            .execute(&mut *tx)
            .await?;

            events::stage(
                &mut tx,
                &DomainEvent::InvitationCancelledEvent {
                    invitation_id: invitation.invitation_id,
                    company_id: company.company_id,
                    company_name: company.name.clone(),
                    company_domain: company.domain.clone(),
                    email: invitation.email.clone(),
                    cancelled_by: actor.user_id,
                    reason: reason.clone(),
                },
            )
            .await?;
        }

        let cancelled = cancellable.len() as u64;
        tx.commit().await?;
        self.drain_outbox().await;

        info!(
            company_id = company.company_id,
            cancelled_by = actor.user_id,
            cancelled,
            "Invitations cancelled"
        );
        Ok(cancelled)
    }

    /// Background sweep: move every due pending invitation to Expired and
    /// stage one event per row, all in one transaction. Rows are locked for
    /// the duration, so a concurrent cancel either wins before the sweep sees
    /// the row or waits and finds it already expired.
    pub async fn expire_sweep(&self) -> ServiceResult<u64> {
        let mut tx = self.db_pool.begin().await?;

        let due: Vec<Invitation> = sqlx::query_as(
            "SELECT * FROM invitation
             WHERE status = 'pending' AND expires_at <= NOW()
             FOR UPDATE",
        )
        .fetch_all(&mut *tx)
        .await?;

        if due.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let ids: Vec<Uuid> = due.iter().map(|i| i.invitation_id).collect();
        sqlx::query(
            "UPDATE invitation SET status = 'expired', updated_at = NOW()
             WHERE invitation_id = ANY($1)",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let mut companies: HashMap<i32, (String, String)> = HashMap::new();
        for invitation in &due {
            if !companies.contains_key(&invitation.company_id) {
                let row: Option<(String, String)> = sqlx::query_as(
                    "SELECT name, domain FROM company WHERE company_id = $1",
                )
                .bind(invitation.company_id)
                .fetch_optional(&mut *tx)
                .await?;
                companies.insert(
                    invitation.company_id,
                    row.unwrap_or_else(|| (String::new(), String::new())),
                );
            }

            let (name, domain) = &companies[&invitation.company_id];
            events::stage(
                &mut tx,
                &DomainEvent::InvitationExpiredEvent {
                    invitation_id: invitation.invitation_id,
                    company_id: invitation.company_id,
                    company_name: name.clone(),
                    company_domain: domain.clone(),
                    email: invitation.email.clone(),
                },
            )
            .await?;
        }

        let expired = due.len() as u64;
        tx.commit().await?;
        self.drain_outbox().await;

        info!(expired, "Expired invitations swept");
        Ok(expired)
    }

    /// List the company's invitations, optionally filtered by status.
    pub async fn list(
        &self,
        ctx: &AuthContext,
        status: Option<InvitationStatus>,
    ) -> ServiceResult<Vec<InvitationDto>> {
        self.require_active_actor(ctx).await?;

        let rows: Vec<Invitation> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM invitation
                     WHERE company_id = $1 AND status = $2
                     ORDER BY created_at DESC",
                )
                .bind(ctx.company_id)
                .bind(status.as_str())
                .fetch_all(&self.db_pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM invitation WHERE company_id = $1 ORDER BY created_at DESC",
                )
                .bind(ctx.company_id)
                .fetch_all(&self.db_pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Per-status counts for the company's invitations.
    pub async fn stats(&self, ctx: &AuthContext) -> ServiceResult<InvitationStats> {
        self.require_active_actor(ctx).await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM invitation WHERE company_id = $1 GROUP BY status",
        )
        .bind(ctx.company_id)
        .fetch_all(&self.db_pool)
        .await?;

        let mut stats = InvitationStats::default();
        for (status, count) in rows {
            match InvitationStatus::parse(&status) {
                Some(InvitationStatus::Pending) => stats.pending = count,
                Some(InvitationStatus::Accepted) => stats.accepted = count,
                Some(InvitationStatus::Cancelled) => stats.cancelled = count,
                Some(InvitationStatus::Expired) => stats.expired = count,
                Some(InvitationStatus::Failed) => stats.failed = count,
                None => warn!(status, "Unknown invitation status in database"),
            }
        }
        Ok(stats)
    }

    /// Token and row checks shared by validate and register flows.
    async fn checked_invitation(&self, token: &str) -> ServiceResult<(Invitation, Company)> {
        let decoded = self
            .tokens
            .validate_invitation(token)
            .map_err(|r| ServiceError::Validation(r.message().to_string()))?;

        let invitation = sqlx::query_as::<_, Invitation>(
            "SELECT * FROM invitation WHERE invitation_id = $1",
        )
        .bind(decoded.invitation_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::Validation("The link is invalid.".to_string()))?;

        if invitation.status != InvitationStatus::Pending.as_str() {
            return Err(ServiceError::Conflict(
                "Invitation is no longer valid.".to_string(),
            ));
        }
        if invitation.expires_at <= OffsetDateTime::now_utc() {
            return Err(ServiceError::Validation("The link has expired.".to_string()));
        }
        if invitation.email != decoded.email || invitation.company_id != decoded.company_id {
            warn!(
                invitation_id = %invitation.invitation_id,
                "Invitation token does not match its persisted row"
            );
            return Err(ServiceError::Validation("The link is invalid.".to_string()));
        }

        let company = self.load_company(invitation.company_id).await?;
        Ok((invitation, company))
    }

    /// The invitation's roles, or the default member role when none were
    /// requested. Privileged categories are rejected again here in case the
    /// role graph changed since send time.
    async fn resolve_registration_roles(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        requested: &[i32],
    ) -> ServiceResult<Vec<i32>> {
        if requested.is_empty() {
            let default_role: Option<i32> = sqlx::query_scalar(
                "SELECT role_id FROM role WHERE category = 'member' ORDER BY role_id LIMIT 1",
            )
            .fetch_optional(&mut **tx)
            .await?;
            return Ok(default_role.into_iter().collect());
        }

        let categories: Vec<(i32, String)> = sqlx::query_as(
            "SELECT role_id, category FROM role WHERE role_id = ANY($1)",
        )
        .bind(requested)
        .fetch_all(&mut **tx)
        .await?;

        if categories.len() != requested.len() {
            return Err(ServiceError::Validation(
                "One or more requested roles do not exist.".to_string(),
            ));
        }
        for (role_id, category) in &categories {
            let parsed = RoleCategory::parse(category).ok_or_else(|| {
                ServiceError::Validation(format!("Role {} has an unknown category.", role_id))
            })?;
            if parsed.is_privileged() {
                return Err(ServiceError::Forbidden(
                    "Privileged roles cannot be assigned through an invitation.".to_string(),
                ));
            }
        }

        Ok(requested.to_vec())
    }

    async fn validate_invitable_roles(&self, role_ids: &[i32]) -> ServiceResult<()> {
        if role_ids.is_empty() {
            return Ok(());
        }

        let categories: Vec<(i32, String)> = sqlx::query_as(
            "SELECT role_id, category FROM role WHERE role_id = ANY($1)",
        )
        .bind(role_ids)
        .fetch_all(&self.db_pool)
        .await?;

        if categories.len() != role_ids.len() {
            return Err(ServiceError::Validation(
                "One or more requested roles do not exist.".to_string(),
            ));
        }
        for (role_id, category) in &categories {
            let parsed = RoleCategory::parse(category).ok_or_else(|| {
                ServiceError::Validation(format!("Role {} has an unknown category.", role_id))
            })?;
            if parsed.is_privileged() {
                return Err(ServiceError::Forbidden(
                    "Privileged roles cannot be assigned through an invitation.".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn load_company(&self, company_id: i32) -> ServiceResult<Company> {
        sqlx::query_as::<_, Company>("SELECT * FROM company WHERE company_id = $1")
            .bind(company_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Company"))
    }

    async fn require_active_actor(&self, ctx: &AuthContext) -> ServiceResult<TaxUser> {
        sqlx::query_as::<_, TaxUser>(
            "SELECT * FROM tax_user
             WHERE user_id = $1 AND company_id = $2 AND is_active = TRUE",
        )
        .bind(ctx.user_id)
        .bind(ctx.company_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::Forbidden("Account is not active.".to_string()))
    }

    async fn require_active_owner(&self, company_id: i32) -> ServiceResult<()> {
        let owners: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tax_user
             WHERE company_id = $1 AND is_active = TRUE AND is_owner = TRUE",
        )
        .bind(company_id)
        .fetch_one(&self.db_pool)
        .await?;

        if owners == 0 {
            return Err(ServiceError::Conflict(
                "Company has no active owner.".to_string(),
            ));
        }
        Ok(())
    }

    async fn email_registered(&self, email: &str) -> ServiceResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tax_user WHERE email = $1)")
                .bind(email)
                .fetch_one(&self.db_pool)
                .await?;
        Ok(exists)
    }

    async fn drain_outbox(&self) {
        if let Err(e) = events::publish_pending(&self.db_pool, self.publisher.as_ref()).await {
            error!("Outbox drain failed: {}", e);
        }
    }
}

fn normalize_email(email: &str) -> ServiceResult<String> {
    let email = email.trim().to_lowercase();
    if email.len() < 3 || !email.contains('@') {
        return Err(ServiceError::Validation(
            "A valid email address is required.".to_string(),
        ));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogPublisher;
    use sqlx::postgres::PgPoolOptions;
    use std::env;

    #[test]
    fn test_email_normalization() {
        assert_eq!(
            normalize_email("  New@Example.COM ").unwrap(),
            "new@example.com"
        );
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("").is_err());
    }

    async fn setup_test_db() -> PgPool {
        dotenv::dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("Failed to create database connection pool");

        sqlx::migrate!("./sql/migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn test_invitation_service(pool: PgPool) -> InvitationService {
        env::set_var("JWT_SECRET", "test_secret_key_for_invitation_tests");
        let tokens = Arc::new(TokenService::from_env().unwrap());
        let config = AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            origin: "http://localhost:8080".to_string(),
        };
        InvitationService::new(pool, tokens, config, Arc::new(LogPublisher))
    }

    /// Creates a company with an active plan and a confirmed owner holding
    /// the Administrator role. Returns (company_id, owner ctx).
    async fn seed_company(pool: &PgPool, user_limit: i32) -> (i32, AuthContext) {
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();

        let company_id: i32 = sqlx::query_scalar(
            "INSERT INTO company (name, domain, created_at, updated_at)
             VALUES ($1, $2, NOW(), NOW()) RETURNING company_id",
        )
        .bind(format!("Test Co {}", stamp))
        .bind(format!("test-co-{}", stamp))
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO custom_plan (company_id, user_limit, is_active, created_at, updated_at)
             VALUES ($1, $2, TRUE, NOW(), NOW())",
        )
        .bind(company_id)
        .bind(user_limit)
        .execute(pool)
        .await
        .unwrap();

        let owner_id: i32 = sqlx::query_scalar(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, 'x', 'Owner', 'User', TRUE, TRUE, TRUE, NOW(), NOW())
             RETURNING user_id",
        )
        .bind(company_id)
        .bind(format!("owner_{}@example.com", stamp))
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO user_role (user_id, role_id, created_at)
             SELECT $1, role_id, NOW() FROM role WHERE category = 'administrator'
             ON CONFLICT DO NOTHING",
        )
        .bind(owner_id)
        .execute(pool)
        .await
        .unwrap();

        let ctx = AuthContext {
            user_id: owner_id,
            company_id,
            session_id: None,
            is_owner: true,
            role_categories: vec![RoleCategory::Owner, RoleCategory::Administrator],
        };
        (company_id, ctx)
    }

    async fn fill_to_limit(pool: &PgPool, company_id: i32, user_limit: i32) {
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        // The seeded owner already occupies one seat
        for i in 1..user_limit {
            sqlx::query(
                "INSERT INTO tax_user
                     (company_id, email, password_hash, first_name, last_name,
                      is_active, is_owner, is_confirmed, created_at, updated_at)
                 VALUES ($1, $2, 'x', 'Filler', 'User', TRUE, FALSE, TRUE, NOW(), NOW())",
            )
            .bind(company_id)
            .bind(format!("filler_{}_{}@example.com", stamp, i))
            .execute(pool)
            .await
            .unwrap();
        }
    }

    /// Pull the invitation token out of the staged send event's link.
    async fn latest_invitation_token(pool: &PgPool, company_id: i32) -> String {
        let payload: String = sqlx::query_scalar(
            "SELECT payload FROM event_outbox
             WHERE event_type = 'UserInvitationSentEvent' AND payload LIKE $1
             ORDER BY occurred_on DESC LIMIT 1",
        )
        .bind(format!("%\"company_id\":{}%", company_id))
        .fetch_one(pool)
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let link = value["invitation_link"].as_str().unwrap();
        link.split("token=").nth(1).unwrap().to_string()
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_invitation_blocked_at_user_limit() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (company_id, ctx) = seed_company(&pool, 5).await;
        fill_to_limit(&pool, company_id, 5).await;

        let err = service
            .send(&ctx, "overflow@example.com", &[])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "User limit exceeded. Current: 5, Limit: 5."
        );
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_full_invitation_registration_flow() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (company_id, ctx) = seed_company(&pool, 5).await;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let invitee = format!("invitee_{}@example.com", stamp);

        let sent = service.send(&ctx, &invitee, &[]).await.unwrap();
        assert_eq!(sent.status, "pending");

        let token = latest_invitation_token(&pool, company_id).await;

        let validation = service.validate(&token).await.unwrap();
        assert_eq!(validation.company_id, company_id);
        assert_eq!(validation.email, invitee);

        let registered = service
            .register_by_invitation(
                &token,
                RegistrationRequest {
                    password: "a-strong-password".to_string(),
                    first_name: "New".to_string(),
                    last_name: "Member".to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap();

        assert!(registered.is_active);
        assert!(registered.is_confirmed);
        // Owner holds the Administrator role, so its grants are cloned
        assert!(registered.inherited_permissions > 0);

        // The row is consumed; a second registration attempt fails cleanly
        let err = service
            .register_by_invitation(
                &token,
                RegistrationRequest {
                    password: "a-strong-password".to_string(),
                    first_name: "New".to_string(),
                    last_name: "Member".to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invitation is no longer valid.");
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_registration_blocked_without_active_owner() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (company_id, ctx) = seed_company(&pool, 5).await;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let invitee = format!("orphan_{}@example.com", stamp);

        service.send(&ctx, &invitee, &[]).await.unwrap();
        let token = latest_invitation_token(&pool, company_id).await;

        // The sole owner goes inactive after the invitation went out
        sqlx::query("UPDATE tax_user SET is_active = FALSE WHERE user_id = $1")
            .bind(ctx.user_id)
            .execute(&pool)
            .await
            .unwrap();

        let err = service.validate(&token).await.unwrap_err();
        assert_eq!(err.to_string(), "Company has no active owner.");

        let err = service
            .register_by_invitation(
                &token,
                RegistrationRequest {
                    password: "a-strong-password".to_string(),
                    first_name: "New".to_string(),
                    last_name: "Member".to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Company has no active owner.");

        // The row stays pending and untouched
        let status: String =
            sqlx::query_scalar("SELECT status FROM invitation WHERE company_id = $1")
                .bind(company_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_concurrent_sends_yield_one_pending_invitation() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (company_id, ctx) = seed_company(&pool, 5).await;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let invitee = format!("race_{}@example.com", stamp);

        let (first, second) = tokio::join!(
            service.send(&ctx, &invitee, &[]),
            service.send(&ctx, &invitee, &[]),
        );
        assert!(
            first.is_ok() != second.is_ok(),
            "exactly one of two concurrent sends must win"
        );

        let err = if first.is_err() {
            first.unwrap_err()
        } else {
            second.unwrap_err()
        };
        assert_eq!(
            err.to_string(),
            "A pending invitation already exists for this email."
        );

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM invitation
             WHERE company_id = $1 AND email = $2 AND status = 'pending'",
        )
        .bind(company_id)
        .bind(&invitee)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_double_cancel_is_safe() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (_, ctx) = seed_company(&pool, 5).await;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();

        let sent = service
            .send(&ctx, &format!("cancelme_{}@example.com", stamp), &[])
            .await
            .unwrap();

        let cancelled = service
            .cancel(&ctx, &[sent.invitation_id], None)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let err = service
            .cancel(&ctx, &[sent.invitation_id], None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No valid invitations to cancel.");
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_expire_sweep_emits_one_event_per_row() {
        let pool = setup_test_db().await;
        let service = test_invitation_service(pool.clone());

        let (company_id, ctx) = seed_company(&pool, 10).await;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();

        for i in 0..3 {
            let sent = service
                .send(&ctx, &format!("due_{}_{}@example.com", stamp, i), &[])
                .await
                .unwrap();
            // Backdate the expiry so the sweep picks the row up
            sqlx::query("UPDATE invitation SET expires_at = NOW() - INTERVAL '1 hour' WHERE invitation_id = $1")
                .bind(sent.invitation_id)
                .execute(&pool)
                .await
                .unwrap();
        }

        let expired = service.expire_sweep().await.unwrap();
        assert!(expired >= 3);

        let events: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM event_outbox
             WHERE event_type = 'InvitationExpiredEvent' AND payload LIKE $1",
        )
        .bind(format!("%\"company_id\":{}%", company_id))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(events, 3);
    }
}
