//! Session tokens.
//!
//! Sessions are HS256 JWTs carrying the user id, role and display name. The
//! middleware turns a valid token into a [`Session`] request extension; an
//! absent or invalid token leaves the request anonymous and the gate decides.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use reportbox_storage::{Role, User};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::gate::Session;
use crate::state::AppState;

/// Cookie name checked when no `Authorization` header is present.
pub const SESSION_COOKIE: &str = "reportbox_session";

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    pub role: Role,
    /// Display name.
    pub name: String,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
    /// Issued at (Unix timestamp).
    pub iat: u64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    /// Claims for `user`, valid for `config.jwt_expiry` seconds.
    pub fn for_user(user: &User, config: &AuthConfig) -> Self {
        let now = now_secs();
        Self {
            sub: user.id.clone(),
            role: user.role,
            name: user.name.clone(),
            exp: now + config.jwt_expiry,
            iat: now,
            iss: config.issuer.clone(),
            aud: config.audience.clone(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp < now_secs()
    }

    pub fn into_session(self) -> Session {
        Session::new(self.sub, self.role, self.name)
    }
}

fn now_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

/// Issues and validates session tokens.
pub struct AuthService {
    config: AuthConfig,
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .field("configured", &self.encoding_key.is_some())
            .finish()
    }
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let (encoding_key, decoding_key) = match config.jwt_secret.as_ref() {
            Some(secret) => (
                Some(EncodingKey::from_secret(secret.as_bytes())),
                Some(DecodingKey::from_secret(secret.as_bytes())),
            ),
            None => (None, None),
        };

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Whether a signing secret is configured.
    pub fn is_configured(&self) -> bool {
        self.decoding_key.is_some()
    }

    /// Mint a session token for `user`.
    pub fn issue_token(&self, user: &User) -> AppResult<String> {
        let encoding_key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AppError::Internal("JWT secret not configured".to_string()))?;

        let claims = Claims::for_user(user, &self.config);

        encode(&Header::default(), &claims, encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to generate token: {e}")))
    }

    /// `Set-Cookie` value carrying `token` for browser clients.
    pub fn session_cookie(&self, token: &str) -> String {
        format!(
            "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.config.jwt_expiry
        )
    }

    /// Validate a token against the configured issuer and audience.
    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AppError::Authentication("sessions are not configured".to_string()))?;

        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.validate_nbf = false;

        let token_data = decode::<Claims>(token, decoding_key, &validation)
            .map_err(|e| AppError::Authentication(format!("Invalid token: {e}")))?;

        if token_data.claims.is_expired() {
            return Err(AppError::Authentication("Token expired".to_string()));
        }

        Ok(token_data.claims)
    }
}

/// Parse Bearer token from Authorization header.
pub fn parse_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
}

/// Read the session cookie out of a `Cookie` header value.
pub fn parse_session_cookie(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

/// Find a session token in the request headers. The header wins over the cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer_token)
    {
        return Some(token);
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_session_cookie)
}

/// Attach a [`Session`] to requests that carry a valid token.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let session = match extract_token(request.headers()) {
        Some(token) => match state.auth.validate_token(token) {
            Ok(claims) => Some(claims.into_session()),
            Err(e) => {
                warn!(error = %e, "Rejected session token");
                None
            }
        },
        None => {
            debug!("No session token provided");
            None
        }
    };

    if let Some(session) = session {
        request.extensions_mut().insert(session);
    }

    next.run(request).await
}

/// Extractor for the optional session of the current request.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Option<Session>);

impl CurrentSession {
    pub fn session(&self) -> Option<&Session> {
        self.0.as_ref()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Session>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some("test-secret".to_string()),
            ..AuthConfig::default()
        }
    }

    fn teacher() -> User {
        User::new("T-001", "Ms. Smith", Role::Teacher).with_id("t1")
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer_token("bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer_token("Basic abc123"), None);
    }

    #[test]
    fn test_parse_session_cookie() {
        assert_eq!(
            parse_session_cookie("theme=dark; reportbox_session=tok; lang=en"),
            Some("tok")
        );
        assert_eq!(parse_session_cookie("reportbox_session="), None);
        assert_eq!(parse_session_cookie("other=1"), None);
    }

    #[test]
    fn test_extract_token_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("reportbox_session=c"));
        assert_eq!(extract_token(&headers), Some("c"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer h"));
        assert_eq!(extract_token(&headers), Some("h"));
    }

    #[test]
    fn test_token_round_trip() {
        let service = AuthService::new(config());
        let token = service.issue_token(&teacher()).unwrap();
        let session = service.validate_token(&token).unwrap().into_session();

        assert_eq!(session, Session::new("t1", Role::Teacher, "Ms. Smith"));
    }

    #[test]
    fn test_session_cookie_round_trip() {
        let service = AuthService::new(config());
        let cookie = service.session_cookie("tok");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.ends_with("Max-Age=86400"));

        let pair = cookie.split(';').next().unwrap();
        assert_eq!(parse_session_cookie(pair), Some("tok"));
    }

    #[test]
    fn test_wrong_secret_or_audience_rejected() {
        let token = AuthService::new(config()).issue_token(&teacher()).unwrap();

        let other_secret = AuthService::new(AuthConfig {
            jwt_secret: Some("other".to_string()),
            ..AuthConfig::default()
        });
        assert!(other_secret.validate_token(&token).is_err());

        let other_audience = AuthService::new(AuthConfig {
            audience: "someone-else".to_string(),
            ..config()
        });
        assert!(other_audience.validate_token(&token).is_err());
    }

    #[test]
    fn test_unconfigured_service_rejects() {
        let service = AuthService::new(AuthConfig::default());
        assert!(!service.is_configured());
        assert!(service.issue_token(&teacher()).is_err());
        assert!(service.validate_token("abc").is_err());
    }
}
