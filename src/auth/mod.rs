mod session_service;

use anyhow::{Result, anyhow};
use jsonwebtoken::{encode, decode, Header, Validation, EncodingKey, DecodingKey, Algorithm};
use serde::{Deserialize, Serialize};
use std::env;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{AuthContext, RoleCategory};

pub use session_service::{
    hash_password, verify_password, LoginOutcome, SessionDto, SessionService, HIDDEN_TOKEN,
};

/// Purpose claim values for capability tokens.
pub const PURPOSE_INVITATION: &str = "invitation";
pub const PURPOSE_CONFIRMATION: &str = "confirmation";
pub const PURPOSE_PASSWORD_RESET: &str = "password_reset";

const TYP_ACCESS: &str = "access";
const TYP_REFRESH: &str = "refresh";

/// Claims carried by invitation/confirmation/password-reset capability tokens.
/// The token references a persisted invitation row by id; the row is the source
/// of truth, the token is just a signed capability pointing at it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Token purpose, one of the PURPOSE_* constants
    pub purpose: String,
    /// Company the capability is scoped to
    pub cid: i32,
    /// Email the capability was issued for
    pub email: String,
    /// Invitation row id (invitation tokens only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inv: Option<Uuid>,
    /// Role ids carried by an invitation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_ids: Vec<i32>,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

/// Claims encoded in session access and refresh tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: i32,
    /// Company the session belongs to
    pub cid: i32,
    /// Session row id
    pub sid: Uuid,
    /// Whether the user is a company owner
    pub owner: bool,
    /// Role categories assigned to the user
    pub roles: Vec<String>,
    /// Token type: access or refresh
    pub typ: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

/// Decoded, verified invitation capability.
#[derive(Debug, Clone)]
pub struct InvitationToken {
    pub invitation_id: Uuid,
    pub company_id: i32,
    pub email: String,
    pub role_ids: Vec<i32>,
    pub expires_at: OffsetDateTime,
}

/// Decoded, verified confirmation or password-reset capability.
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    pub company_id: i32,
    pub email: String,
}

/// Structured rejection for a capability token. The user-facing message is
/// deliberately generic; the underlying cryptographic detail is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Expired,
    Invalid,
}

impl TokenRejection {
    pub fn message(&self) -> &'static str {
        match self {
            TokenRejection::Expired => "The token has expired.",
            TokenRejection::Invalid => "The token is invalid.",
        }
    }
}

/// Issues and validates every signed token in the system: invitation,
/// confirmation, and password-reset capabilities plus session access/refresh
/// pairs. Stateless; the signing secret and expiry windows come from the
/// environment.
pub struct TokenService {
    /// Secret key for signing tokens
    encoding_key: EncodingKey,
    /// Key for verifying token signatures
    decoding_key: DecodingKey,
    /// Issuer claim value
    issuer: String,
    /// Invitation token lifetime
    invitation_ttl: Duration,
    /// Account confirmation token lifetime
    confirmation_ttl: Duration,
    /// Password reset token lifetime
    reset_ttl: Duration,
    /// Access token lifetime
    pub access_ttl: Duration,
    /// Refresh token lifetime
    pub refresh_ttl: Duration,
}

fn env_seconds(name: &str, default: i64) -> Result<i64> {
    match env::var(name) {
        Ok(v) => v
            .parse::<i64>()
            .map_err(|_| anyhow!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

impl TokenService {
    /// Initialize token configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let secret = env::var("JWT_SECRET").map_err(|_| anyhow!("JWT_SECRET must be set"))?;
        let issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "firmhub".to_string());

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            invitation_ttl: Duration::seconds(env_seconds(
                "INVITATION_TOKEN_TTL_SECONDS",
                7 * 24 * 3600,
            )?),
            confirmation_ttl: Duration::seconds(env_seconds(
                "CONFIRMATION_TOKEN_TTL_SECONDS",
                3 * 24 * 3600,
            )?),
            reset_ttl: Duration::seconds(env_seconds("RESET_TOKEN_TTL_SECONDS", 3600)?),
            access_ttl: Duration::seconds(env_seconds("ACCESS_TOKEN_TTL_SECONDS", 24 * 3600)?),
            refresh_ttl: Duration::seconds(env_seconds("REFRESH_TOKEN_TTL_SECONDS", 48 * 3600)?),
        })
    }

    /// Generate an invitation capability token referencing a persisted
    /// invitation row. Returns the token and its expiry.
    pub fn generate_invitation(
        &self,
        invitation_id: Uuid,
        company_id: i32,
        email: &str,
        role_ids: &[i32],
    ) -> Result<(String, OffsetDateTime)> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.invitation_ttl;

        let claims = CapabilityClaims {
            purpose: PURPOSE_INVITATION.to_string(),
            cid: company_id,
            email: email.to_string(),
            inv: Some(invitation_id),
            role_ids: role_ids.to_vec(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to generate invitation token: {}", e))?;

        debug!("Generated invitation token for invitation_id: {}", invitation_id);
        Ok((token, expires_at))
    }

    /// Validate an invitation capability token. Signature and expiry failures
    /// come back as a structured rejection so callers can degrade gracefully.
    pub fn validate_invitation(&self, token: &str) -> Result<InvitationToken, TokenRejection> {
        let claims = self.decode_capability(token, PURPOSE_INVITATION)?;
        let invitation_id = claims.inv.ok_or_else(|| {
            warn!("Invitation token missing invitation id claim");
            TokenRejection::Invalid
        })?;

        Ok(InvitationToken {
            invitation_id,
            company_id: claims.cid,
            email: claims.email,
            role_ids: claims.role_ids,
            expires_at: OffsetDateTime::from_unix_timestamp(claims.exp)
                .map_err(|_| TokenRejection::Invalid)?,
        })
    }

    /// Generate an account confirmation token for a freshly registered user.
    pub fn generate_confirmation(&self, company_id: i32, email: &str) -> Result<(String, OffsetDateTime)> {
        self.generate_capability(PURPOSE_CONFIRMATION, company_id, email, self.confirmation_ttl)
    }

    pub fn validate_confirmation(&self, token: &str) -> Result<ConfirmationToken, TokenRejection> {
        let claims = self.decode_capability(token, PURPOSE_CONFIRMATION)?;
        Ok(ConfirmationToken {
            company_id: claims.cid,
            email: claims.email,
        })
    }

    /// Generate a password reset token. Same contract as confirmation, shorter
    /// expiry window.
    pub fn generate_password_reset(&self, company_id: i32, email: &str) -> Result<(String, OffsetDateTime)> {
        self.generate_capability(PURPOSE_PASSWORD_RESET, company_id, email, self.reset_ttl)
    }

    pub fn validate_password_reset(&self, token: &str) -> Result<ConfirmationToken, TokenRejection> {
        let claims = self.decode_capability(token, PURPOSE_PASSWORD_RESET)?;
        Ok(ConfirmationToken {
            company_id: claims.cid,
            email: claims.email,
        })
    }

    fn generate_capability(
        &self,
        purpose: &str,
        company_id: i32,
        email: &str,
        ttl: Duration,
    ) -> Result<(String, OffsetDateTime)> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;

        let claims = CapabilityClaims {
            purpose: purpose.to_string(),
            cid: company_id,
            email: email.to_string(),
            inv: None,
            role_ids: vec![],
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to generate {} token: {}", purpose, e))?;

        Ok((token, expires_at))
    }

    fn decode_capability(
        &self,
        token: &str,
        expected_purpose: &str,
    ) -> Result<CapabilityClaims, TokenRejection> {
        let validation = Validation::new(Algorithm::HS256);

        let data = decode::<CapabilityClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    debug!("Capability token expired");
                    TokenRejection::Expired
                }
                kind => {
                    warn!("Capability token rejected: {:?}", kind);
                    TokenRejection::Invalid
                }
            })?;

        if data.claims.purpose != expected_purpose {
            warn!(
                "Capability token purpose mismatch: expected {}, got {}",
                expected_purpose, data.claims.purpose
            );
            return Err(TokenRejection::Invalid);
        }

        Ok(data.claims)
    }

    /// Generate a session access token bound to a session id.
    pub fn generate_access_token(&self, ctx: &AuthContext) -> Result<(String, OffsetDateTime)> {
        self.generate_session_token(ctx, TYP_ACCESS, self.access_ttl)
    }

    /// Generate a session refresh token bound to the same session id.
    pub fn generate_refresh_token(&self, ctx: &AuthContext) -> Result<(String, OffsetDateTime)> {
        self.generate_session_token(ctx, TYP_REFRESH, self.refresh_ttl)
    }

    fn generate_session_token(
        &self,
        ctx: &AuthContext,
        typ: &str,
        ttl: Duration,
    ) -> Result<(String, OffsetDateTime)> {
        let session_id = ctx
            .session_id
            .ok_or_else(|| anyhow!("Session tokens require a session id"))?;
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;

        let claims = SessionClaims {
            sub: ctx.user_id,
            cid: ctx.company_id,
            sid: session_id,
            owner: ctx.is_owner,
            roles: ctx
                .role_categories
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            typ: typ.to_string(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to generate session token: {}", e))?;

        debug!("Generated {} token for user_id: {}", typ, ctx.user_id);
        Ok((token, expires_at))
    }

    /// Validate a session access token and extract the auth context.
    pub fn validate_access_token(&self, token: &str) -> Result<AuthContext, TokenRejection> {
        self.validate_session_token(token, TYP_ACCESS)
    }

    /// Validate a session refresh token and extract the auth context.
    pub fn validate_refresh_token(&self, token: &str) -> Result<AuthContext, TokenRejection> {
        self.validate_session_token(token, TYP_REFRESH)
    }

    fn validate_session_token(
        &self,
        token: &str,
        expected_typ: &str,
    ) -> Result<AuthContext, TokenRejection> {
        let validation = Validation::new(Algorithm::HS256);

        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenRejection::Expired,
                kind => {
                    warn!("Session token rejected: {:?}", kind);
                    TokenRejection::Invalid
                }
            })?;

        if data.claims.typ != expected_typ {
            warn!(
                "Session token type mismatch: expected {}, got {}",
                expected_typ, data.claims.typ
            );
            return Err(TokenRejection::Invalid);
        }

        debug!("Validated {} token for user_id: {}", expected_typ, data.claims.sub);
        Ok(Self::claims_to_auth_context(data.claims))
    }

    /// Convert session claims to AuthContext
    pub fn claims_to_auth_context(claims: SessionClaims) -> AuthContext {
        let role_categories = claims
            .roles
            .iter()
            .filter_map(|r| RoleCategory::parse(r))
            .collect();

        AuthContext {
            user_id: claims.sub,
            company_id: claims.cid,
            session_id: Some(claims.sid),
            is_owner: claims.owner,
            role_categories,
        }
    }
}
