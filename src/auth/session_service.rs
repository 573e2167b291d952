use std::sync::Arc;

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
    },
    Argon2,
};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::events::{self, DomainEvent, EventPublisher};
use crate::limits::LimitPolicy;
use crate::model::{AuthContext, RoleCategory, Session, TaxUser};

use super::TokenService;

/// Literal substituted for raw token values in every session DTO. Masking is a
/// hard invariant; no query path returns the stored strings.
pub const HIDDEN_TOKEN: &str = "***HIDDEN***";

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> ServiceResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ServiceError::Validation(format!("Password hashing error: {}", e)))?
        .to_string();
    Ok(password_hash)
}

/// Verify a password against a hash using Argon2
pub fn verify_password(password: &str, password_hash: &str) -> ServiceResult<bool> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|e| ServiceError::Validation(format!("Password hash parsing error: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Tokens and metadata handed back after a successful login or refresh.
#[derive(Debug, Serialize)]
pub struct LoginOutcome {
    pub session_id: Uuid,
    pub user_id: i32,
    pub company_id: i32,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: OffsetDateTime,
    pub refresh_expires_at: OffsetDateTime,
}

/// Session projection with token values masked.
#[derive(Debug, Serialize)]
pub struct SessionDto {
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
}

impl From<Session> for SessionDto {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.session_id,
            user_id: s.user_id,
            access_token: HIDDEN_TOKEN.to_string(),
            refresh_token: HIDDEN_TOKEN.to_string(),
            access_expires_at: s.access_expires_at,
            refresh_expires_at: s.refresh_expires_at,
            is_revoked: s.is_revoked,
            device: s.device,
            ip_address: s.ip_address,
            created_at: s.created_at,
        }
    }
}

/// Issues and revokes login sessions and enforces per-company visibility for
/// session queries. Revocation is last-writer-wins and idempotent.
pub struct SessionService {
    db_pool: PgPool,
    tokens: Arc<TokenService>,
    publisher: Arc<dyn EventPublisher>,
}

impl SessionService {
    pub fn new(
        db_pool: PgPool,
        tokens: Arc<TokenService>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            db_pool,
            tokens,
            publisher,
        }
    }

    /// Authenticate a user and mint an access/refresh pair bound to a new
    /// session row.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device: Option<String>,
        ip_address: Option<String>,
    ) -> ServiceResult<LoginOutcome> {
        let email = email.trim().to_lowercase();

        let user = sqlx::query_as::<_, TaxUser>("SELECT * FROM tax_user WHERE email = $1")
            .bind(&email)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::Forbidden("Invalid credentials.".to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = user.user_id, "Password verification failed");
            return Err(ServiceError::Forbidden("Invalid credentials.".to_string()));
        }
        if !user.is_active {
            return Err(ServiceError::Forbidden("Account is not active.".to_string()));
        }
        if !user.is_confirmed {
            return Err(ServiceError::Forbidden(
                "Account is not confirmed.".to_string(),
            ));
        }

        let role_categories = self.load_role_categories(user.user_id).await?;
        if !RoleCategory::permits_portal_login(&role_categories) {
            return Err(ServiceError::Forbidden(
                "This account cannot log in to this portal.".to_string(),
            ));
        }

        // Minted once; both tokens and the session row carry this exact id
        let session_id = Uuid::new_v4();
        let ctx = AuthContext {
            user_id: user.user_id,
            company_id: user.company_id,
            session_id: Some(session_id),
            is_owner: user.is_owner,
            role_categories,
        };

        let (access_token, access_expires_at) =
            self.tokens.generate_access_token(&ctx).map_err(|e| {
                error!("Access token generation failed: {}", e);
                ServiceError::Validation("Could not create the session.".to_string())
            })?;
        let (refresh_token, refresh_expires_at) =
            self.tokens.generate_refresh_token(&ctx).map_err(|e| {
                error!("Refresh token generation failed: {}", e);
                ServiceError::Validation("Could not create the session.".to_string())
            })?;

        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "INSERT INTO session
                 (session_id, user_id, access_token, refresh_token,
                  access_expires_at, refresh_expires_at, is_revoked, device, ip_address,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, NOW(), NOW())",
        )
        .bind(session_id)
        .bind(user.user_id)
        .bind(&access_token)
        .bind(&refresh_token)
        .bind(access_expires_at)
        .bind(refresh_expires_at)
        .bind(&device)
        .bind(&ip_address)
        .execute(&mut *tx)
        .await?;

        events::stage(
            &mut tx,
            &DomainEvent::UserLoginEvent {
                user_id: user.user_id,
                company_id: user.company_id,
                session_id,
                email: user.email.clone(),
                device: device.clone(),
                ip_address: ip_address.clone(),
            },
        )
        .await?;
        events::stage(
            &mut tx,
            &DomainEvent::UserPresenceChangedEvent {
                user_id: user.user_id,
                company_id: user.company_id,
                online: true,
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(user_id = user.user_id, session_id = %session_id, "User logged in");

        Ok(LoginOutcome {
            session_id,
            user_id: user.user_id,
            company_id: user.company_id,
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Rotate the access/refresh pair on an existing, unrevoked session.
    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<LoginOutcome> {
        let ctx = self
            .tokens
            .validate_refresh_token(refresh_token)
            .map_err(|r| ServiceError::Forbidden(r.message().to_string()))?;
        let session_id = ctx
            .session_id
            .ok_or_else(|| ServiceError::Forbidden("The token is invalid.".to_string()))?;

        let session =
            sqlx::query_as::<_, Session>("SELECT * FROM session WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.db_pool)
                .await?
                .ok_or_else(|| ServiceError::Forbidden("Session not found.".to_string()))?;

        let now = OffsetDateTime::now_utc();
        if session.is_revoked {
            return Err(ServiceError::Forbidden("Session is revoked.".to_string()));
        }
        if session.refresh_expires_at <= now {
            return Err(ServiceError::Forbidden("Session has expired.".to_string()));
        }
        // Reject tokens superseded by an earlier rotation
        if session.refresh_token != refresh_token {
            warn!(session_id = %session_id, "Stale refresh token presented");
            return Err(ServiceError::Forbidden("Session is revoked.".to_string()));
        }

        let user = sqlx::query_as::<_, TaxUser>(
            "SELECT * FROM tax_user WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(session.user_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::Forbidden("Account is not active.".to_string()))?;

        let fresh_ctx = AuthContext {
            user_id: user.user_id,
            company_id: user.company_id,
            session_id: Some(session_id),
            is_owner: user.is_owner,
            role_categories: self.load_role_categories(user.user_id).await?,
        };

        let (access_token, access_expires_at) =
            self.tokens.generate_access_token(&fresh_ctx).map_err(|e| {
                error!("Access token generation failed: {}", e);
                ServiceError::Validation("Could not refresh the session.".to_string())
            })?;
        let (new_refresh_token, refresh_expires_at) =
            self.tokens.generate_refresh_token(&fresh_ctx).map_err(|e| {
                error!("Refresh token generation failed: {}", e);
                ServiceError::Validation("Could not refresh the session.".to_string())
            })?;

        sqlx::query(
            "UPDATE session
             SET access_token = $1, refresh_token = $2,
                 access_expires_at = $3, refresh_expires_at = $4, updated_at = NOW()
             WHERE session_id = $5",
        )
        .bind(&access_token)
        .bind(&new_refresh_token)
        .bind(access_expires_at)
        .bind(refresh_expires_at)
        .bind(session_id)
        .execute(&self.db_pool)
        .await?;

        info!(user_id = user.user_id, session_id = %session_id, "Session refreshed");

        Ok(LoginOutcome {
            session_id,
            user_id: user.user_id,
            company_id: user.company_id,
            access_token,
            refresh_token: new_refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Revoke the calling session. Idempotent; revoking twice is harmless.
    pub async fn logout(&self, ctx: &AuthContext) -> ServiceResult<()> {
        let session_id = ctx
            .session_id
            .ok_or_else(|| ServiceError::Validation("No session to log out.".to_string()))?;

        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "UPDATE session SET is_revoked = TRUE, updated_at = NOW()
             WHERE session_id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(ctx.user_id)
        .execute(&mut *tx)
        .await?;

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM session
             WHERE user_id = $1 AND is_revoked = FALSE AND refresh_expires_at > NOW()",
        )
        .bind(ctx.user_id)
        .fetch_one(&mut *tx)
        .await?;

        if remaining == 0 {
            events::stage(
                &mut tx,
                &DomainEvent::UserPresenceChangedEvent {
                    user_id: ctx.user_id,
                    company_id: ctx.company_id,
                    online: false,
                },
            )
            .await?;
        }

        tx.commit().await?;
        self.drain_outbox().await;

        info!(user_id = ctx.user_id, session_id = %session_id, "User logged out");
        Ok(())
    }

    /// Revoke every session of the calling user.
    pub async fn logout_all(&self, ctx: &AuthContext) -> ServiceResult<u64> {
        let mut tx = self.db_pool.begin().await?;

        let result = sqlx::query(
            "UPDATE session SET is_revoked = TRUE, updated_at = NOW()
             WHERE user_id = $1 AND is_revoked = FALSE",
        )
        .bind(ctx.user_id)
        .execute(&mut *tx)
        .await?;

        events::stage(
            &mut tx,
            &DomainEvent::UserPresenceChangedEvent {
                user_id: ctx.user_id,
                company_id: ctx.company_id,
                online: false,
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        let revoked = result.rows_affected();
        info!(user_id = ctx.user_id, revoked, "All sessions revoked");
        Ok(revoked)
    }

    /// Admin-initiated revocation. An owner may revoke any session in their
    /// company; anyone else only their own. The check runs per session;
    /// unauthorized ids are skipped, and revoking nothing is a Forbidden.
    pub async fn revoke_sessions(
        &self,
        ctx: &AuthContext,
        session_ids: &[Uuid],
    ) -> ServiceResult<u64> {
        if session_ids.is_empty() {
            return Err(ServiceError::Validation(
                "At least one session id is required.".to_string(),
            ));
        }

        let mut revoked = 0u64;
        for session_id in session_ids {
            let row: Option<(Uuid, i32, i32)> = sqlx::query_as(
                "SELECT s.session_id, s.user_id, u.company_id
                 FROM session s JOIN tax_user u ON u.user_id = s.user_id
                 WHERE s.session_id = $1",
            )
            .bind(session_id)
            .fetch_optional(&self.db_pool)
            .await?;

            let Some((session_id, owner_user_id, company_id)) = row else {
                continue;
            };

            let authorized = owner_user_id == ctx.user_id
                || (ctx.is_owner && company_id == ctx.company_id);
            if !authorized {
                warn!(
                    session_id = %session_id,
                    actor_id = ctx.user_id,
                    "Skipping unauthorized session revocation"
                );
                continue;
            }

            sqlx::query(
                "UPDATE session SET is_revoked = TRUE, updated_at = NOW() WHERE session_id = $1",
            )
            .bind(session_id)
            .execute(&self.db_pool)
            .await?;
            revoked += 1;
        }

        if revoked == 0 {
            return Err(ServiceError::Forbidden(
                "Not authorized to revoke these sessions.".to_string(),
            ));
        }

        info!(actor_id = ctx.user_id, revoked, "Sessions revoked");
        Ok(revoked)
    }

    /// The caller's own unrevoked, unexpired sessions, tokens masked.
    pub async fn list_own_active(&self, ctx: &AuthContext) -> ServiceResult<Vec<SessionDto>> {
        let rows: Vec<Session> = sqlx::query_as(
            "SELECT * FROM session
             WHERE user_id = $1 AND is_revoked = FALSE AND refresh_expires_at > NOW()
             ORDER BY created_at DESC",
        )
        .bind(ctx.user_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Every session in the caller's company, owners only, tokens masked.
    pub async fn list_company(&self, ctx: &AuthContext) -> ServiceResult<Vec<SessionDto>> {
        if !ctx.is_owner {
            return Err(ServiceError::Forbidden(
                "Only owners may list company sessions.".to_string(),
            ));
        }

        let rows: Vec<Session> = sqlx::query_as(
            "SELECT s.* FROM session s
             JOIN tax_user u ON u.user_id = s.user_id
             WHERE u.company_id = $1
             ORDER BY s.created_at DESC",
        )
        .bind(ctx.company_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Soft-disable a user and cascade-revoke their sessions. The last active
    /// owner of a company cannot be disabled.
    pub async fn disable_user(&self, ctx: &AuthContext, target_user_id: i32) -> ServiceResult<()> {
        if !ctx.is_owner {
            return Err(ServiceError::Forbidden(
                "Only owners may disable users.".to_string(),
            ));
        }

        let mut tx = self.db_pool.begin().await?;

        // Serialize disables within a company so the owner count below cannot
        // be read by two concurrent transactions before either commits
        sqlx::query("SELECT company_id FROM company WHERE company_id = $1 FOR UPDATE")
            .bind(ctx.company_id)
            .execute(&mut *tx)
            .await?;

        let target = sqlx::query_as::<_, TaxUser>(
            "SELECT * FROM tax_user WHERE user_id = $1 AND company_id = $2 FOR UPDATE",
        )
        .bind(target_user_id)
        .bind(ctx.company_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::not_found("User"))?;

        if !target.is_active {
            return Err(ServiceError::Conflict("User is already disabled.".to_string()));
        }

        if target.is_owner {
            let active_owners: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM tax_user
                 WHERE company_id = $1 AND is_active = TRUE AND is_owner = TRUE",
            )
            .bind(ctx.company_id)
            .fetch_one(&mut *tx)
            .await?;

            if active_owners <= 1 {
                return Err(ServiceError::Conflict(
                    "Cannot disable the last active owner of the company.".to_string(),
                ));
            }
        }

        sqlx::query("UPDATE tax_user SET is_active = FALSE, updated_at = NOW() WHERE user_id = $1")
            .bind(target.user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE session SET is_revoked = TRUE, updated_at = NOW()
             WHERE user_id = $1 AND is_revoked = FALSE",
        )
        .bind(target.user_id)
        .execute(&mut *tx)
        .await?;

        events::stage(
            &mut tx,
            &DomainEvent::UserPresenceChangedEvent {
                user_id: target.user_id,
                company_id: ctx.company_id,
                online: false,
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(
            target_user_id = target.user_id,
            actor_id = ctx.user_id,
            "User disabled"
        );
        Ok(())
    }

    /// Re-enable a disabled user. Counts against the plan's user limit like
    /// any other activation; owners included.
    pub async fn enable_user(&self, ctx: &AuthContext, target_user_id: i32) -> ServiceResult<()> {
        if !ctx.is_owner {
            return Err(ServiceError::Forbidden(
                "Only owners may enable users.".to_string(),
            ));
        }

        let target = sqlx::query_as::<_, TaxUser>(
            "SELECT * FROM tax_user WHERE user_id = $1 AND company_id = $2",
        )
        .bind(target_user_id)
        .bind(ctx.company_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("User"))?;

        if target.is_active {
            return Err(ServiceError::Conflict("User is already active.".to_string()));
        }

        LimitPolicy::check_company(&self.db_pool, ctx.company_id, false).await?;

        sqlx::query("UPDATE tax_user SET is_active = TRUE, updated_at = NOW() WHERE user_id = $1")
            .bind(target.user_id)
            .execute(&self.db_pool)
            .await?;

        info!(
            target_user_id = target.user_id,
            actor_id = ctx.user_id,
            "User enabled"
        );
        Ok(())
    }

    async fn load_role_categories(&self, user_id: i32) -> ServiceResult<Vec<RoleCategory>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT r.category FROM role r
             JOIN user_role ur ON r.role_id = ur.role_id
             WHERE ur.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(names.iter().filter_map(|n| RoleCategory::parse(n)).collect())
    }

    async fn drain_outbox(&self) {
        if let Err(e) = events::publish_pending(&self.db_pool, self.publisher.as_ref()).await {
            error!("Outbox drain failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogPublisher;
    use sqlx::postgres::PgPoolOptions;
    use std::env;

    #[test]
    fn test_password_hashing() {
        let password = "test_password";
        let hash = hash_password(password).unwrap();

        // Verify the password against the hash
        assert!(verify_password(password, &hash).unwrap());

        // Verify an incorrect password fails
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_session_dto_masks_tokens() {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: 1,
            access_token: "raw-access-token".to_string(),
            refresh_token: "raw-refresh-token".to_string(),
            access_expires_at: now,
            refresh_expires_at: now,
            is_revoked: false,
            device: Some("cli".to_string()),
            ip_address: None,
            created_at: now,
            updated_at: now,
        };

        let dto = SessionDto::from(session);
        assert_eq!(dto.access_token, HIDDEN_TOKEN);
        assert_eq!(dto.refresh_token, HIDDEN_TOKEN);

        let json = serde_json::to_string(&dto).unwrap();
        assert!(!json.contains("raw-access-token"));
        assert!(!json.contains("raw-refresh-token"));
        assert!(json.contains("***HIDDEN***"));
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

    fn test_session_service(pool: PgPool) -> SessionService {
        env::set_var("JWT_SECRET", "test_secret_key_for_session_tests");
        let tokens = Arc::new(TokenService::from_env().unwrap());
        SessionService::new(pool, tokens, Arc::new(LogPublisher))
    }

    async fn seed_owner(pool: &PgPool, password: &str) -> (i32, AuthContext, String) {
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let email = format!("owner_{}@example.com", stamp);

        let company_id: i32 = sqlx::query_scalar(
            "INSERT INTO company (name, domain, created_at, updated_at)
             VALUES ($1, $2, NOW(), NOW()) RETURNING company_id",
        )
        .bind(format!("Session Co {}", stamp))
        .bind(format!("session-co-{}", stamp))
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO custom_plan (company_id, user_limit, is_active, created_at, updated_at)
             VALUES ($1, 5, TRUE, NOW(), NOW())",
        )
        .bind(company_id)
        .execute(pool)
        .await
        .unwrap();

        let hash = hash_password(password).unwrap();
        let user_id: i32 = sqlx::query_scalar(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, $3, 'Owner', 'User', TRUE, TRUE, TRUE, NOW(), NOW())
             RETURNING user_id",
        )
        .bind(company_id)
        .bind(&email)
        .bind(&hash)
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO user_role (user_id, role_id, created_at)
             SELECT $1, role_id, NOW() FROM role WHERE category = 'owner'
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();

        let ctx = AuthContext {
            user_id,
            company_id,
            session_id: None,
            is_owner: true,
            role_categories: vec![RoleCategory::Owner],
        };
        (company_id, ctx, email)
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_last_active_owner_cannot_be_disabled() {
        let pool = setup_test_db().await;
        let service = test_session_service(pool.clone());

        let (_, ctx, _) = seed_owner(&pool, "a-strong-password").await;

        let err = service.disable_user(&ctx, ctx.user_id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot disable the last active owner of the company."
        );
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_concurrent_owner_disables_keep_one_owner_active() {
        let pool = setup_test_db().await;
        let service = test_session_service(pool.clone());

        let (company_id, first_ctx, _) = seed_owner(&pool, "a-strong-password").await;

        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let second_owner_id: i32 = sqlx::query_scalar(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, 'x', 'Second', 'Owner', TRUE, TRUE, TRUE, NOW(), NOW())
             RETURNING user_id",
        )
        .bind(company_id)
        .bind(format!("second_owner_{}@example.com", stamp))
        .fetch_one(&pool)
        .await
        .unwrap();

        let second_ctx = AuthContext {
            user_id: second_owner_id,
            company_id,
            session_id: None,
            is_owner: true,
            role_categories: vec![RoleCategory::Owner],
        };

        // Each owner tries to disable the other at the same time; only one
        // disable may win
        let (first, second) = tokio::join!(
            service.disable_user(&first_ctx, second_owner_id),
            service.disable_user(&second_ctx, first_ctx.user_id),
        );
        assert!(
            first.is_err() || second.is_err(),
            "both owners were disabled concurrently"
        );

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tax_user
             WHERE company_id = $1 AND is_active = TRUE AND is_owner = TRUE",
        )
        .bind(company_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(remaining >= 1);
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_login_refresh_and_rotation() {
        let pool = setup_test_db().await;
        let service = test_session_service(pool.clone());

        let (_, _, email) = seed_owner(&pool, "a-strong-password").await;

        let outcome = service
            .login(&email, "a-strong-password", Some("cli".to_string()), None)
            .await
            .unwrap();
        assert_ne!(outcome.access_token, outcome.refresh_token);

        // Both tokens carry the same session id as the persisted row
        let tokens = TokenService::from_env().unwrap();
        let decoded = tokens.validate_access_token(&outcome.access_token).unwrap();
        assert_eq!(decoded.session_id, Some(outcome.session_id));
        let decoded = tokens.validate_refresh_token(&outcome.refresh_token).unwrap();
        assert_eq!(decoded.session_id, Some(outcome.session_id));

        let rotated = service.refresh(&outcome.refresh_token).await.unwrap();
        assert_eq!(rotated.session_id, outcome.session_id);

        // The pre-rotation refresh token is no longer honored
        let err = service.refresh(&outcome.refresh_token).await.unwrap_err();
        assert_eq!(err.to_string(), "Session is revoked.");
    }

    #[tokio::test]
    #[ignore = "requires a provisioned Postgres database"]
    async fn test_disable_cascades_session_revocation() {
        let pool = setup_test_db().await;
        let service = test_session_service(pool.clone());

        let (company_id, owner_ctx, _) = seed_owner(&pool, "a-strong-password").await;

        // A second, non-owner member with a live session
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let member_email = format!("member_{}@example.com", stamp);
        let hash = hash_password("a-strong-password").unwrap();
        let member_id: i32 = sqlx::query_scalar(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, $3, 'Member', 'User', TRUE, FALSE, TRUE, NOW(), NOW())
             RETURNING user_id",
        )
        .bind(company_id)
        .bind(&member_email)
        .bind(&hash)
        .fetch_one(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO user_role (user_id, role_id, created_at)
             SELECT $1, role_id, NOW() FROM role WHERE category = 'member'
             ON CONFLICT DO NOTHING",
        )
        .bind(member_id)
        .execute(&pool)
        .await
        .unwrap();

        let outcome = service
            .login(&member_email, "a-strong-password", None, None)
            .await
            .unwrap();

        service.disable_user(&owner_ctx, member_id).await.unwrap();

        let revoked: bool =
            sqlx::query_scalar("SELECT is_revoked FROM session WHERE session_id = $1")
                .bind(outcome.session_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(revoked);

        // A disabled account cannot log back in
        let err = service
            .login(&member_email, "a-strong-password", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Account is not active.");
    }
}
