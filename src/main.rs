use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dotenv::dotenv;
use sqlx::Connection;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod account;
mod auth;
mod config;
mod db;
mod error;
mod events;
mod http;
mod invitation;
mod limits;
mod model;
mod permission;

use account::AccountService;
use auth::{SessionService, TokenService};
use config::AppConfig;
use events::LogPublisher;
use invitation::InvitationService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment variables from .env file
    dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting firmhub");

    // Create a single admin connection for migrations
    info!("Creating admin connection for database migrations");
    let mut admin_conn = db::create_admin_connection().await?;

    // Run migrations using admin connection
    info!("Running database migrations with admin privileges");
    sqlx::migrate!("./sql/migrations").run(&mut admin_conn).await?;
    info!("Migrations completed successfully");

    // Close admin connection after migrations are complete
    info!("Closing admin database connection");
    let _ = admin_conn.close().await;

    // Initialize regular application database connection pool
    let pool = db::init_pool().await?;
    info!("Application database connection initialized");

    let app_config = AppConfig::from_env()?;
    let tokens = Arc::new(TokenService::from_env()?);
    let publisher = Arc::new(LogPublisher);

    let sessions = Arc::new(SessionService::new(
        pool.clone(),
        tokens.clone(),
        publisher.clone(),
    ));
    let invitations = Arc::new(InvitationService::new(
        pool.clone(),
        tokens.clone(),
        app_config.clone(),
        publisher.clone(),
    ));
    let accounts = Arc::new(AccountService::new(
        pool.clone(),
        tokens.clone(),
        app_config.clone(),
        publisher.clone(),
    ));
    info!("Services initialized");

    // Background expiry sweep and outbox drain
    let sweep_interval = std::env::var("EXPIRE_SWEEP_INTERVAL_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300);
    {
        let invitations = invitations.clone();
        let pool = pool.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
            loop {
                interval.tick().await;
                match invitations.expire_sweep().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "Invitation expiry sweep completed"),
                    Err(e) => error!("Invitation expiry sweep failed: {}", e),
                }
                if let Err(e) = events::publish_pending(&pool, publisher.as_ref()).await {
                    error!("Outbox drain failed: {}", e);
                }
            }
        });
    }
    info!("Expiry sweep scheduled every {}s", sweep_interval);

    let state = http::AppState {
        db_pool: pool,
        tokens,
        sessions,
        invitations,
        accounts,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&app_config.bind_addr).await?;
    info!("Listening on {}", app_config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
