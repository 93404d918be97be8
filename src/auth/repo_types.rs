use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::claims::Role;

/// User record in the database. Credential and recovery fields never leave
/// the process: they are skipped by serde and absent from `SafeUser`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub image: Option<String>,
    #[serde(skip_serializing)]
    pub reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub reset_token_expiry: Option<OffsetDateTime>,
    pub email_verified: Option<OffsetDateTime>,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    /// True when the stored reset token matches the presented one and has
    /// not passed its stored expiry. Single use is enforced here: once the
    /// fields are cleared, no token matches.
    pub fn reset_token_matches(&self, token: &str, now: OffsetDateTime) -> bool {
        match (&self.reset_token, self.reset_token_expiry) {
            (Some(stored), Some(expiry)) => stored == token && now < expiry,
            _ => false,
        }
    }
}
