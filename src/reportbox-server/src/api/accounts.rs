//! Local accounts: registration, login and password changes.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use reportbox_storage::{Role, StorageError, User};
use tracing::{info, warn};

use crate::auth::CurrentSession;
use crate::error::{AppError, AppResult};
use crate::gate::{Action, Denial, authorize};
use crate::password::{MIN_PASSWORD_LEN, hash_password, verify_password};
use crate::state::AppState;

use super::parse_json;
use super::types::{
    ChangePasswordRequest, LoginRequest, LoginResponse, RegisterRequest, SuccessResponse,
    UserProfile,
};

/// Exact length of a student number.
pub const STUDENT_ID_LEN: usize = 10;

fn validate_registration(request: &RegisterRequest) -> AppResult<()> {
    if request.name.trim().chars().count() < 2 {
        return Err(AppError::BadRequest(
            "name must be at least 2 characters".to_string(),
        ));
    }
    if request.student_id.chars().count() != STUDENT_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "student id must be exactly {STUDENT_ID_LEN} characters"
        )));
    }
    if request.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// `POST /auth/register` - open sign-up, always as a student.
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<UserProfile>)> {
    let request: RegisterRequest = parse_json(&body)?;
    validate_registration(&request)?;

    let hash = hash_password(request.password).await?;
    let user = User::new(request.student_id, request.name.trim(), Role::Student)
        .with_password_hash(hash);

    match state.store.insert_user(user).await {
        Ok(user) => {
            info!(user_id = %user.id, student_id = %user.student_id, "User registered");
            Ok((StatusCode::CREATED, Json(user.into())))
        }
        Err(StorageError::Conflict(reason)) => Err(AppError::BadRequest(reason)),
        Err(e) => Err(e.into()),
    }
}

/// `POST /auth/login` - exchange credentials for a session token.
///
/// The token is returned in the body and as the session cookie.
pub async fn login(State(state): State<Arc<AppState>>, body: Bytes) -> AppResult<Response> {
    let request: LoginRequest = parse_json(&body)?;
    let invalid = || AppError::Authentication("invalid student id or password".to_string());

    let user = state
        .store
        .find_user_by_student_id(&request.student_id)
        .await?
        .ok_or_else(invalid)?;
    let stored = user.password_hash.clone().ok_or_else(invalid)?;

    if !verify_password(request.password, stored).await? {
        warn!(student_id = %request.student_id, "Login refused");
        return Err(invalid());
    }

    let token = state.auth.issue_token(&user)?;
    let cookie = state.auth.session_cookie(&token);
    info!(user_id = %user.id, role = %user.role, "Session issued");

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse {
            token,
            user: user.into(),
        }),
    )
        .into_response())
}

/// `POST /auth/change-password`
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Json<SuccessResponse>> {
    authorize(session.session(), &Action::ChangePassword)?;
    let caller = session.session().ok_or(Denial::Unauthenticated)?;
    let request: ChangePasswordRequest = parse_json(&body)?;

    let (Some(old_password), Some(new_password)) = (
        request.old_password.filter(|p| !p.is_empty()),
        request.new_password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::BadRequest(
            "oldPassword and newPassword are required".to_string(),
        ));
    };
    if new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let user = state
        .store
        .get_user(&caller.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", caller.user_id)))?;

    let matches = match user.password_hash {
        Some(stored) => verify_password(old_password, stored).await?,
        None => false,
    };
    if !matches {
        return Err(AppError::BadRequest(
            "current password is incorrect".to_string(),
        ));
    }

    let hash = hash_password(new_password).await?;
    state.store.set_password_hash(&user.id, &hash).await?;
    info!(user_id = %user.id, "Password changed");

    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, student_id: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            student_id: student_id.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_registration_rules() {
        assert!(validate_registration(&request("Al", "2021000009", "secret")).is_ok());
        assert!(validate_registration(&request(" A ", "2021000009", "secret")).is_err());
        assert!(validate_registration(&request("Alice", "202100000", "secret")).is_err());
        assert!(validate_registration(&request("Alice", "20210000099", "secret")).is_err());
        assert!(validate_registration(&request("Alice", "2021000009", "short")).is_err());
    }
}
