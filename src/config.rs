use serde::Deserialize;

/// Settings for the session JWT. `ttl_minutes` is the single source of
/// truth for session lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

/// Settings for the password-reset token cipher.
#[derive(Debug, Clone, Deserialize)]
pub struct ResetConfig {
    pub encryption_key: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub base_url: String,
    pub demo_mode: bool,
    pub production: bool,
    pub session: SessionConfig,
    pub reset: ResetConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET")?,
            issuer: std::env::var("SESSION_ISSUER").unwrap_or_else(|_| "nexus-auth".into()),
            audience: std::env::var("SESSION_AUDIENCE")
                .unwrap_or_else(|_| "nexus-auth-users".into()),
            ttl_minutes: std::env::var("SESSION_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60),
        };
        let reset = ResetConfig {
            encryption_key: std::env::var("ENCRYPTION_KEY")?,
            ttl_minutes: std::env::var("RESET_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60),
        };
        Ok(Self {
            database_url,
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            demo_mode: std::env::var("DEMO_MODE")
                .map(|v| v == "true")
                .unwrap_or(false),
            production: std::env::var("APP_ENV")
                .map(|v| v == "production")
                .unwrap_or(false),
            session,
            reset,
        })
    }
}
