use anyhow::Result;
use std::env;

/// Application-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// Public origin used when building out-of-band links
    pub origin: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            origin: env::var("APP_ORIGIN").unwrap_or_else(|_| "http://localhost:8080".to_string()),
        })
    }

    /// `{origin}/auth/confirm?email={email}&token={token}`
    pub fn confirmation_link(&self, email: &str, token: &str) -> String {
        format!("{}/auth/confirm?email={}&token={}", self.origin, email, token)
    }

    /// `{origin}/auth/invitation?email={email}&token={token}`
    pub fn invitation_link(&self, email: &str, token: &str) -> String {
        format!("{}/auth/invitation?email={}&token={}", self.origin, email, token)
    }
}
