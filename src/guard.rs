use axum::{
    extract::{FromRef, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use time::OffsetDateTime;

use crate::{
    auth::{
        claims::{Role, SessionClaims},
        session::SessionKeys,
    },
    error::ApiError,
    state::AppState,
};

/// Paths that require a live session.
const PROTECTED_ROUTES: &[&str] = &["/dashboard", "/profile", "/settings", "/api/user"];

/// Login/registration/recovery pages; a logged-in user is bounced away.
const AUTH_ROUTES: &[&str] = &[
    "/auth/login",
    "/auth/register",
    "/auth/forgot-password",
    "/auth/reset-password",
];

const ADMIN_PREFIX: &str = "/admin";
const LOGIN_PATH: &str = "/auth/login";
const LANDING_PATH: &str = "/dashboard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Redirect(String),
    Deny(StatusCode),
}

fn matches_any(path: &str, routes: &[&str]) -> bool {
    routes.iter().any(|route| path.starts_with(route))
}

/// Classify one request. Pure: no I/O beyond the claims already decoded
/// from the token. An expired session counts as no session at all.
pub fn evaluate(
    method: &Method,
    path: &str,
    session: Option<&SessionClaims>,
    now: OffsetDateTime,
) -> GuardDecision {
    let live = session.filter(|claims| !claims.is_expired(now));

    // Registration is the one unauthenticated operation on /api/user.
    if path == "/api/user" && method == Method::POST {
        return GuardDecision::Allow;
    }

    if matches_any(path, PROTECTED_ROUTES) && live.is_none() {
        if path.starts_with("/api/") {
            return GuardDecision::Deny(StatusCode::UNAUTHORIZED);
        }
        let callback = urlencoding::encode(path);
        return GuardDecision::Redirect(format!("{LOGIN_PATH}?callbackUrl={callback}"));
    }

    if matches_any(path, AUTH_ROUTES) && live.is_some() {
        return GuardDecision::Redirect(LANDING_PATH.to_string());
    }

    if path.starts_with(ADMIN_PREFIX) {
        // Non-admins are sent to the landing page, not a 403.
        match live {
            Some(claims) if claims.role == Role::Admin => {}
            _ => return GuardDecision::Redirect(LANDING_PATH.to_string()),
        }
    }

    GuardDecision::Allow
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

fn apply_security_headers(response: &mut Response, production: bool) {
    let headers: &[(HeaderName, HeaderValue)] = &[
        (
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ),
        (
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ),
        (
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ),
        (
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        (
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static(
                "camera=(), microphone=(), geolocation=(), interest-cohort=()",
            ),
        ),
        (
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        ),
    ];
    for (name, value) in headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }

    // The development policy admits remote sources so local frontends work.
    let csp = if production {
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self' 'unsafe-inline'; \
             style-src 'self' 'unsafe-inline'; img-src 'self' data:; \
             font-src 'self' data:; connect-src 'self'",
        )
    } else {
        HeaderValue::from_static(
            "default-src 'self' *; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
             style-src 'self' 'unsafe-inline'; img-src 'self' data: *; \
             font-src 'self' data: *; connect-src 'self' *",
        )
    };
    response
        .headers_mut()
        .insert(HeaderName::from_static("content-security-policy"), csp);
}

/// Applied to every request. Decodes the bearer token leniently (the guard
/// has its own expiry rule) and enforces the classification.
pub async fn route_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let keys = SessionKeys::from_ref(&state);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let session = bearer_token(request.headers()).and_then(|token| keys.peek(token).ok());

    let mut response = match evaluate(&method, &path, session.as_ref(), OffsetDateTime::now_utc()) {
        GuardDecision::Allow => next.run(request).await,
        GuardDecision::Redirect(to) => Redirect::temporary(&to).into_response(),
        GuardDecision::Deny(_) => ApiError::Unauthorized.into_response(),
    };

    apply_security_headers(&mut response, state.config.production);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    fn session(role: Role, exp: OffsetDateTime) -> SessionClaims {
        SessionClaims {
            sub: Uuid::new_v4(),
            email: "a@b.com".into(),
            name: "Jo".into(),
            role,
            iat: 0,
            exp: exp.unix_timestamp() as usize,
            iss: "iss".into(),
            aud: "aud".into(),
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn live(role: Role) -> SessionClaims {
        session(role, now() + Duration::hours(1))
    }

    fn expired(role: Role) -> SessionClaims {
        session(role, now() - Duration::hours(1))
    }

    #[test]
    fn unauthenticated_protected_page_redirects_to_login_with_callback() {
        assert_eq!(
            evaluate(&Method::GET, "/dashboard", None, now()),
            GuardDecision::Redirect("/auth/login?callbackUrl=%2Fdashboard".into())
        );
        assert_eq!(
            evaluate(&Method::GET, "/settings/security", None, now()),
            GuardDecision::Redirect("/auth/login?callbackUrl=%2Fsettings%2Fsecurity".into())
        );
    }

    #[test]
    fn unauthenticated_registration_post_is_allowed() {
        assert_eq!(
            evaluate(&Method::POST, "/api/user", None, now()),
            GuardDecision::Allow
        );
    }

    #[test]
    fn unauthenticated_protected_api_gets_401() {
        assert_eq!(
            evaluate(&Method::GET, "/api/user", None, now()),
            GuardDecision::Deny(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn expired_session_is_treated_as_absent() {
        let claims = expired(Role::User);
        assert_eq!(
            evaluate(&Method::GET, "/dashboard", Some(&claims), now()),
            GuardDecision::Redirect("/auth/login?callbackUrl=%2Fdashboard".into())
        );
        assert_eq!(
            evaluate(&Method::GET, "/api/user", Some(&claims), now()),
            GuardDecision::Deny(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn authenticated_user_is_bounced_off_auth_pages() {
        let claims = live(Role::User);
        assert_eq!(
            evaluate(&Method::GET, "/auth/login", Some(&claims), now()),
            GuardDecision::Redirect("/dashboard".into())
        );
        assert_eq!(
            evaluate(&Method::GET, "/auth/register", Some(&claims), now()),
            GuardDecision::Redirect("/dashboard".into())
        );
    }

    #[test]
    fn expired_session_may_visit_auth_pages() {
        let claims = expired(Role::User);
        assert_eq!(
            evaluate(&Method::GET, "/auth/login", Some(&claims), now()),
            GuardDecision::Allow
        );
    }

    #[test]
    fn authenticated_user_passes_protected_routes() {
        let claims = live(Role::User);
        assert_eq!(evaluate(&Method::GET, "/dashboard", Some(&claims), now()), GuardDecision::Allow);
        assert_eq!(evaluate(&Method::GET, "/api/user", Some(&claims), now()), GuardDecision::Allow);
    }

    #[test]
    fn admin_routes_silently_downgrade_non_admins() {
        let user = live(Role::User);
        assert_eq!(
            evaluate(&Method::GET, "/admin", Some(&user), now()),
            GuardDecision::Redirect("/dashboard".into())
        );
        assert_eq!(
            evaluate(&Method::GET, "/admin/users", None, now()),
            GuardDecision::Redirect("/dashboard".into())
        );

        let admin = live(Role::Admin);
        assert_eq!(evaluate(&Method::GET, "/admin/users", Some(&admin), now()), GuardDecision::Allow);
    }

    #[test]
    fn security_headers_are_attached_to_every_response() {
        let mut response = Response::new(axum::body::Body::empty());
        apply_security_headers(&mut response, true);
        for name in [
            "x-content-type-options",
            "x-frame-options",
            "x-xss-protection",
            "referrer-policy",
            "permissions-policy",
            "strict-transport-security",
            "content-security-policy",
        ] {
            assert!(response.headers().contains_key(name), "missing {name}");
        }
        let csp = response.headers()["content-security-policy"]
            .to_str()
            .unwrap();
        assert!(csp.contains("connect-src 'self'"));
        assert!(!csp.contains("connect-src 'self' *"));

        let mut dev = Response::new(axum::body::Body::empty());
        apply_security_headers(&mut dev, false);
        let dev_csp = dev.headers()["content-security-policy"].to_str().unwrap();
        assert!(dev_csp.contains("connect-src 'self' *"));
    }

    #[test]
    fn public_paths_are_allowed_for_everyone() {
        assert_eq!(evaluate(&Method::GET, "/", None, now()), GuardDecision::Allow);
        assert_eq!(evaluate(&Method::GET, "/features", None, now()), GuardDecision::Allow);
        let claims = live(Role::User);
        assert_eq!(evaluate(&Method::GET, "/features", Some(&claims), now()), GuardDecision::Allow);
    }
}
