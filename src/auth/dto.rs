use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{claims::Role, password::validate_password_strength, repo_types::User},
    error::FieldErrors,
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        let name = self.name.trim();
        if name.len() < 2 || name.len() > 50 {
            errors.insert("name".into(), "Name must be 2 to 50 characters".into());
        }
        if !is_valid_email(&self.email) {
            errors.insert("email".into(), "Please enter a valid email address".into());
        }
        let password_errors = validate_password_strength(&self.password);
        if !password_errors.is_empty() {
            errors.insert("password".into(), password_errors.join(". "));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for profile updates; absent fields are left unchanged.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub image: Option<String>,
}

impl UpdateUserRequest {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if let Some(name) = &self.name {
            let name = name.trim();
            if name.len() < 2 || name.len() > 50 {
                errors.insert("name".into(), "Name must be 2 to 50 characters".into());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

impl ResetPasswordRequest {
    pub fn validate(&self) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if self.token.is_empty() {
            errors.insert("token".into(), "Reset token is required".into());
        }
        let password_errors = validate_password_strength(&self.password);
        if !password_errors.is_empty() {
            errors.insert("password".into(), password_errors.join(". "));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Safe projection of a user record: no hash, no reset fields.
#[derive(Debug, Serialize)]
pub struct SafeUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub image: Option<String>,
    pub email_verified: Option<OffsetDateTime>,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl From<User> for SafeUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
            image: user.image,
            email_verified: user.email_verified,
            last_login: user.last_login,
            created_at: user.created_at,
        }
    }
}

/// Response returned after login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: SafeUser,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: &'static str,
}

/// Forgot-password always answers with the same message; the reset URL is
/// attached only outside production.
#[derive(Debug, Serialize)]
pub struct ForgotPasswordResponse {
    pub success: bool,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DemoStatusResponse {
    pub demo_mode: bool,
}
