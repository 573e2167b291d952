use anyhow::{anyhow, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::{env, str::FromStr};
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection pool used by all services at runtime.
pub async fn init_pool() -> Result<PgPool> {
    let database_url =
        env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;
    let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let options = PgConnectOptions::from_str(&database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    info!(max_connections, "Database connection pool initialized");
    Ok(pool)
}

/// Single privileged connection used only to run migrations at startup.
/// Falls back to DATABASE_URL when no separate admin role is configured.
pub async fn create_admin_connection() -> Result<PgConnection> {
    let url = env::var("DATABASE_ADMIN_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow!("DATABASE_ADMIN_URL or DATABASE_URL must be set"))?;

    let options = PgConnectOptions::from_str(&url)?;
    let conn = PgConnection::connect_with(&options).await?;

    info!("Admin database connection established");
    Ok(conn)
}
