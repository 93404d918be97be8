use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            is_valid_email, AuthResponse, DemoStatusResponse, ForgotPasswordRequest,
            ForgotPasswordResponse, LoginRequest, MessageResponse, RegisterRequest,
            ResetPasswordRequest, SafeUser, UpdateUserRequest,
        },
        extractors::AuthSession,
        password::{hash_password, verify_password},
        repo::is_unique_violation,
        repo_types::User,
        reset::ResetKeys,
        session::SessionKeys,
    },
    error::{ApiError, ApiResult, FieldErrors},
    state::AppState,
};

const GENERIC_FORGOT_MESSAGE: &str =
    "If an account with this email exists, a password reset link has been sent.";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/user", post(register).get(get_me).patch(update_me))
        .route("/demo-status", get(demo_status))
}

fn email_error() -> FieldErrors {
    let mut errors = FieldErrors::new();
    errors.insert("email".into(), "Please enter a valid email address".into());
    errors
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SafeUser>)> {
    if state.config.demo_mode {
        return Err(ApiError::Forbidden(
            "Registration is disabled in demo mode".into(),
        ));
    }

    payload.email = payload.email.trim().to_lowercase();
    payload.validate().map_err(ApiError::Validation)?;

    if User::find_by_email(&state.db, &payload.email)
        .await?
        .is_some()
    {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::Conflict("User already exists".into()));
    }

    let hash = hash_password(&payload.password)?;
    let user = match User::create(&state.db, &payload.email, payload.name.trim(), &hash).await {
        Ok(user) => user,
        // Lost the race on the unique email index.
        Err(e) if is_unique_violation(&e) => {
            warn!(email = %payload.email, "duplicate registration race");
            return Err(ApiError::Conflict("User already exists".into()));
        }
        Err(e) => return Err(e.into()),
    };

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    payload.email = payload.email.trim().to_lowercase();
    if !is_valid_email(&payload.email) {
        return Err(ApiError::Validation(email_error()));
    }

    // Unknown email and wrong password collapse into the same response so
    // the endpoint cannot be used to enumerate accounts.
    let user = match User::find_by_email(&state.db, &payload.email).await? {
        Some(user) => user,
        None => {
            warn!(email = %payload.email, "login unknown email");
            return Err(ApiError::InvalidCredentials);
        }
    };

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    if let Err(e) = User::touch_last_login(&state.db, user.id).await {
        warn!(error = %e, user_id = %user.id, "failed to stamp last_login");
    }

    let token = SessionKeys::from_ref(&state).sign(&user)?;
    info!(user_id = %user.id, "user logged in");
    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

#[instrument(skip(state, session))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> ApiResult<Json<SafeUser>> {
    let user = User::find_by_id(&state.db, session.sub)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, session, payload))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<UpdateUserRequest>,
) -> ApiResult<Json<SafeUser>> {
    if state.config.demo_mode {
        return Err(ApiError::Forbidden(
            "Profile editing is disabled in demo mode".into(),
        ));
    }

    payload.validate().map_err(ApiError::Validation)?;

    let user = User::update_profile(
        &state.db,
        session.sub,
        payload.name.as_deref().map(str::trim),
        payload.image.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    info!(user_id = %user.id, "profile updated");
    Ok(Json(user.into()))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(mut payload): Json<ForgotPasswordRequest>,
) -> ApiResult<Json<ForgotPasswordResponse>> {
    payload.email = payload.email.trim().to_lowercase();
    if !is_valid_email(&payload.email) {
        return Err(ApiError::Validation(email_error()));
    }

    // The response is identical whether or not the account exists.
    let user = match User::find_by_email(&state.db, &payload.email).await? {
        Some(user) => user,
        None => {
            info!("forgot-password request for unknown email");
            return Ok(Json(ForgotPasswordResponse {
                success: true,
                message: GENERIC_FORGOT_MESSAGE,
                reset_url: None,
            }));
        }
    };

    let reset = ResetKeys::from_ref(&state);
    let now = OffsetDateTime::now_utc();
    let token = reset.issue_at(user.id, now)?;
    User::set_reset_token(&state.db, user.id, &token, reset.expiry_from(now)).await?;

    let reset_url = format!("{}/auth/reset-password/{}", state.config.base_url, token);
    // Stand-in for mail delivery.
    info!(user_id = %user.id, %reset_url, "password reset link issued");

    Ok(Json(ForgotPasswordResponse {
        success: true,
        message: GENERIC_FORGOT_MESSAGE,
        reset_url: (!state.config.production).then_some(reset_url),
    }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    payload.validate().map_err(ApiError::Validation)?;

    let reset = ResetKeys::from_ref(&state);
    let claims = reset.redeem(&payload.token).map_err(|reason| {
        debug!(%reason, "reset token rejected");
        ApiError::TokenInvalid
    })?;

    // The decrypted claims alone are not enough: the token must also match
    // the persisted copy, which is cleared on first use.
    let user = User::find_by_id(&state.db, claims.user_id)
        .await?
        .ok_or(ApiError::TokenInvalid)?;
    if !user.reset_token_matches(&payload.token, OffsetDateTime::now_utc()) {
        warn!(user_id = %user.id, "reset token does not match stored copy");
        return Err(ApiError::TokenInvalid);
    }

    let hash = hash_password(&payload.password)?;
    User::reset_password(&state.db, user.id, &hash).await?;

    info!(user_id = %user.id, "password reset");
    Ok(Json(MessageResponse {
        success: true,
        message: "Password has been reset successfully",
    }))
}

pub async fn demo_status(State(state): State<AppState>) -> Json<DemoStatusResponse> {
    Json(DemoStatusResponse {
        demo_mode: state.config.demo_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::Role;
    use uuid::Uuid;

    fn sample_user() -> User {
        let now = OffsetDateTime::now_utc();
        User {
            id: Uuid::new_v4(),
            email: "test@example.com".into(),
            name: "Test".into(),
            password_hash: "hash".into(),
            role: Role::User,
            image: None,
            reset_token: Some("secret-token".into()),
            reset_token_expiry: Some(now),
            email_verified: None,
            last_login: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn auth_response_has_no_credential_fields() {
        let response = AuthResponse {
            token: "jwt".into(),
            user: sample_user().into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test@example.com"));
        assert!(!json.contains("password"));
        assert!(!json.contains("secret-token"));
    }

    #[test]
    fn forgot_response_omits_reset_url_when_absent() {
        let response = ForgotPasswordResponse {
            success: true,
            message: GENERIC_FORGOT_MESSAGE,
            reset_url: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("reset_url"));
    }
}
