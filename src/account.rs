use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::auth::{hash_password, TokenService};
use crate::config::AppConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{self, DomainEvent, EventPublisher};
use crate::limits::LimitPolicy;
use crate::model::{Company, TaxUser};

/// User limit granted to a freshly self-registered company until a real plan
/// is purchased.
const DEFAULT_USER_LIMIT: i32 = 5;

#[derive(Debug, Deserialize)]
pub struct CompanyRegistration {
    pub company_name: String,
    pub domain: String,
    pub address: Option<String>,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisteredCompany {
    pub company_id: i32,
    pub user_id: i32,
    pub email: String,
}

/// Company self-registration and account confirmation. Self-registered owners
/// start unconfirmed and inactive; the confirmation link flips both flags.
pub struct AccountService {
    db_pool: PgPool,
    tokens: Arc<TokenService>,
    config: AppConfig,
    publisher: Arc<dyn EventPublisher>,
}

impl AccountService {
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

    /// Create a company, its starter plan, and its initial owner.
    pub async fn register_company(
        &self,
        req: CompanyRegistration,
    ) -> ServiceResult<RegisteredCompany> {
        let email = req.email.trim().to_lowercase();
        if email.len() < 3 || !email.contains('@') {
            return Err(ServiceError::Validation(
                "A valid email address is required.".to_string(),
            ));
        }
        if req.password.len() < 8 {
            return Err(ServiceError::Validation(
                "Password must be at least 8 characters.".to_string(),
            ));
        }
        let company_name = req.company_name.trim();
        let domain = req.domain.trim().to_lowercase();
        if company_name.is_empty() || domain.is_empty() {
            return Err(ServiceError::Validation(
                "Company name and domain are required.".to_string(),
            ));
        }

        let email_taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tax_user WHERE email = $1)")
                .bind(&email)
                .fetch_one(&self.db_pool)
                .await?;
        if email_taken {
            return Err(ServiceError::Conflict(
                "Email is already registered.".to_string(),
            ));
        }

        let domain_taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM company WHERE domain = $1)")
                .bind(&domain)
                .fetch_one(&self.db_pool)
                .await?;
        if domain_taken {
            return Err(ServiceError::Conflict(
                "Company domain is already taken.".to_string(),
            ));
        }

        let password_hash = hash_password(&req.password)?;

        let mut tx = self.db_pool.begin().await?;

        let company = sqlx::query_as::<_, Company>(
            "INSERT INTO company (name, domain, address, created_at, updated_at)
             VALUES ($1, $2, $3, NOW(), NOW())
             RETURNING *",
        )
        .bind(company_name)
        .bind(&domain)
        .bind(&req.address)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO custom_plan (company_id, user_limit, is_active, created_at, updated_at)
             VALUES ($1, $2, TRUE, NOW(), NOW())",
        )
        .bind(company.company_id)
        .bind(DEFAULT_USER_LIMIT)
        .execute(&mut *tx)
        .await?;

        // Self-registration starts unconfirmed and inactive, unlike the
        // invitation flow.
        let user = sqlx::query_as::<_, TaxUser>(
            "INSERT INTO tax_user
                 (company_id, email, password_hash, first_name, last_name, phone,
                  is_active, is_owner, is_confirmed, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, TRUE, FALSE, NOW(), NOW())
             RETURNING *",
        )
        .bind(company.company_id)
        .bind(&email)
        .bind(&password_hash)
        .bind(req.first_name.trim())
        .bind(req.last_name.trim())
        .bind(&req.phone)
        .fetch_one(&mut *tx)
        .await?;

        let owner_role: Option<i32> = sqlx::query_scalar(
            "SELECT role_id FROM role WHERE category = 'owner' ORDER BY role_id LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(role_id) = owner_role {
            sqlx::query(
                "INSERT INTO user_role (user_id, role_id, created_at)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (user_id, role_id) DO NOTHING",
            )
            .bind(user.user_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        } else {
            warn!("No owner role defined; registering owner without a role row");
        }

        let (token, _) = self
            .tokens
            .generate_confirmation(company.company_id, &email)
            .map_err(|e| {
                error!("Confirmation token generation failed: {}", e);
                ServiceError::Validation("Could not complete the registration.".to_string())
            })?;

        events::stage(
            &mut tx,
            &DomainEvent::UserRegisteredEvent {
                user_id: user.user_id,
                company_id: company.company_id,
                company_name: company.name.clone(),
                company_domain: company.domain.clone(),
                email: email.clone(),
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
            },
        )
        .await?;
        // Confirmation link travels out-of-band through the email service
        events::stage(
            &mut tx,
            &DomainEvent::AccountConfirmationRequestedEvent {
                user_id: user.user_id,
                company_id: company.company_id,
                email: email.clone(),
                confirmation_link: self.config.confirmation_link(&email, &token),
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(
            company_id = company.company_id,
            user_id = user.user_id,
            "Company registered"
        );

        Ok(RegisteredCompany {
            company_id: company.company_id,
            user_id: user.user_id,
            email,
        })
    }

    /// Consume a confirmation token: flips the account to confirmed+active.
    pub async fn confirm(&self, email: &str, token: &str) -> ServiceResult<()> {
        let claims = self
            .tokens
            .validate_confirmation(token)
            .map_err(|r| ServiceError::Validation(r.message().to_string()))?;

        let email = email.trim().to_lowercase();
        if claims.email != email {
            warn!("Confirmation token email mismatch");
            return Err(ServiceError::Validation("The link is invalid.".to_string()));
        }

        let user = sqlx::query_as::<_, TaxUser>(
            "SELECT * FROM tax_user WHERE email = $1 AND company_id = $2",
        )
        .bind(&email)
        .bind(claims.company_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("User"))?;

        if user.is_confirmed {
            return Err(ServiceError::Conflict(
                "Account is already confirmed.".to_string(),
            ));
        }

        // Activation counts against the plan like any other enable
        LimitPolicy::check_company(&self.db_pool, user.company_id, false).await?;

        let company = sqlx::query_as::<_, Company>(
            "SELECT * FROM company WHERE company_id = $1",
        )
        .bind(user.company_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Company"))?;

        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "UPDATE tax_user SET is_confirmed = TRUE, is_active = TRUE, updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(user.user_id)
        .execute(&mut *tx)
        .await?;

        events::stage(
            &mut tx,
            &DomainEvent::AccountConfirmedEvent {
                user_id: user.user_id,
                company_id: company.company_id,
                company_name: company.name.clone(),
                company_domain: company.domain.clone(),
                email: email.clone(),
            },
        )
        .await?;

        tx.commit().await?;
        self.drain_outbox().await;

        info!(user_id = user.user_id, "Account confirmed");
        Ok(())
    }

    async fn drain_outbox(&self) {
        if let Err(e) = events::publish_pending(&self.db_pool, self.publisher.as_ref()).await {
            error!("Outbox drain failed: {}", e);
        }
    }
}
