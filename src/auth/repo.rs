use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{claims::Role, password::hash_password, repo_types::User};

const USER_COLUMNS: &str = "id, email, name, password_hash, role, image, reset_token, \
     reset_token_expiry, email_verified, last_login, created_at, updated_at";

const DEFAULT_ADMIN_EMAIL: &str = "admin@nexus-auth.example.com";
const DEFAULT_ADMIN_PASSWORD: &str = "Password123!";

impl User {
    /// Find a user by normalized email.
    pub async fn find_by_email(db: &PgPool, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    /// Create a new user with a hashed password. The unique email index is
    /// the guarantee against duplicate-registration races; a violation
    /// surfaces as a database error the handler maps to Conflict.
    pub async fn create(
        db: &PgPool,
        email: &str,
        name: &str,
        password_hash: &str,
    ) -> anyhow::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, name, password_hash) \
             VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(email)
        .bind(name)
        .bind(password_hash)
        .fetch_one(db)
        .await?;
        Ok(user)
    }

    /// Update the allowed profile fields; absent fields keep their value.
    pub async fn update_profile(
        db: &PgPool,
        id: Uuid,
        name: Option<&str>,
        image: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users \
             SET name = COALESCE($2, name), image = COALESCE($3, image), updated_at = now() \
             WHERE id = $1 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(image)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    /// Store a freshly issued reset token and its expiry, overwriting any
    /// previous one.
    pub async fn set_reset_token(
        db: &PgPool,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users \
             SET reset_token = $2, reset_token_expiry = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .bind(expiry)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Set the new password hash and clear both reset fields in one
    /// statement, so the token cannot be replayed.
    pub async fn reset_password(db: &PgPool, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users \
             SET password_hash = $2, reset_token = NULL, reset_token_expiry = NULL, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn touch_last_login(db: &PgPool, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET last_login = now() WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// True when the error is a unique-constraint violation, i.e. the email was
/// taken by a concurrent registration.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| match e {
            sqlx::Error::Database(db) => db.code().map(|c| c == "23505"),
            _ => None,
        })
        .unwrap_or(false)
}

/// Create the default admin account if it does not exist yet. Idempotent;
/// failures are logged and not fatal.
pub async fn seed_default_admin(db: &PgPool) -> anyhow::Result<()> {
    if User::find_by_email(db, DEFAULT_ADMIN_EMAIL).await?.is_some() {
        return Ok(());
    }

    info!(email = DEFAULT_ADMIN_EMAIL, "creating default admin user");
    let hash = hash_password(DEFAULT_ADMIN_PASSWORD)?;
    let result = sqlx::query(
        "INSERT INTO users (email, name, password_hash, role, email_verified) \
         VALUES ($1, $2, $3, $4, now()) \
         ON CONFLICT (email) DO NOTHING",
    )
    .bind(DEFAULT_ADMIN_EMAIL)
    .bind("Admin User")
    .bind(&hash)
    .bind(Role::Admin)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        warn!(email = DEFAULT_ADMIN_EMAIL, "default admin already present");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[derive(Debug)]
    struct StubDbError(&'static str);

    impl std::fmt::Display for StubDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "database error {}", self.0)
        }
    }

    impl std::error::Error for StubDbError {}

    impl sqlx::error::DatabaseError for StubDbError {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(self.0.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> anyhow::Error {
        sqlx::Error::Database(Box::new(StubDbError(code))).into()
    }

    #[test]
    fn unique_violation_is_detected_by_code() {
        assert!(is_unique_violation(&db_error("23505")));
    }

    #[test]
    fn other_database_errors_are_not_unique_violations() {
        // foreign key violation
        assert!(!is_unique_violation(&db_error("23503")));
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&anyhow::anyhow!("connection refused")));
        assert!(!is_unique_violation(&anyhow::Error::from(
            sqlx::Error::RowNotFound
        )));
    }
}
