mod envelope;
mod extract;
mod session;
mod user_company;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::account::AccountService;
use crate::auth::{SessionService, TokenService};
use crate::invitation::InvitationService;

pub use envelope::{ApiEnvelope, ApiError};
pub use extract::CurrentUser;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionService>,
    pub invitations: Arc<InvitationService>,
    pub accounts: Arc<AccountService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/UserCompany/register", post(user_company::register))
        .route("/api/UserCompany/confirm", post(user_company::confirm))
        .route("/api/UserCompany/invite", post(user_company::invite))
        .route(
            "/api/UserCompany/validate-invitation/:token",
            get(user_company::validate_invitation),
        )
        .route(
            "/api/UserCompany/register-by-invitation",
            post(user_company::register_by_invitation),
        )
        .route(
            "/api/UserCompany/cancel-invitations",
            post(user_company::cancel_invitations),
        )
        .route("/api/UserCompany/invitations", get(user_company::list_invitations))
        .route(
            "/api/UserCompany/invitation-stats",
            get(user_company::invitation_stats),
        )
        .route("/api/UserCompany/disable-user", post(user_company::disable_user))
        .route("/api/UserCompany/enable-user", post(user_company::enable_user))
        .route("/api/Session/Login", post(session::login))
        .route("/api/Session/Refresh", post(session::refresh))
        .route("/api/Session/Logout", post(session::logout))
        .route("/api/Session/LogoutAll", post(session::logout_all))
        .route("/api/Session/Revoke", post(session::revoke))
        .route("/api/Session/Active", get(session::active_sessions))
        .route("/api/Session/Company", get(session::company_sessions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
