//! Authentication routes

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use linedesk_shared::UserStatus;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{check_rate_limit, extract_client_ip, MessageResponse};
use crate::{
    auth::{hash_password, jwt::TokenPair, validate_password_strength, verify_password, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserResponse,
}

#[derive(Debug, Serialize, FromRow)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub line_id: Option<Uuid>,
    pub sip_extension: Option<String>,
    pub status: UserStatus,
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct LoginRow {
    id: Uuid,
    password_hash: String,
    role: String,
    email: String,
    is_active: bool,
}

const PROFILE_QUERY: &str = r#"
    SELECT u.id, u.email, u.full_name, r.name AS role, u.line_id, u.sip_extension, u.status
    FROM users u
    JOIN roles r ON r.id = u.role_id
    WHERE u.id = $1
"#;

// =============================================================================
// Helpers
// =============================================================================

async fn issue_session(state: &AppState, user_id: Uuid, role: &str, email: &str) -> ApiResult<TokenPair> {
    let pair = state
        .jwt_manager
        .generate_token_pair(user_id, role, email)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to issue tokens");
            ApiError::Internal
        })?;

    sqlx::query("INSERT INTO user_sessions (user_id, refresh_jti, expires_at) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(&pair.refresh_jti)
        .bind(pair.refresh_expires_at)
        .execute(&state.pool)
        .await?;

    Ok(pair)
}

async fn auth_response(state: &AppState, user_id: Uuid, pair: TokenPair) -> ApiResult<AuthResponse> {
    let user = sqlx::query_as::<_, UserResponse>(PROFILE_QUERY)
        .bind(user_id)
        .fetch_one(&state.pool)
        .await?;

    Ok(AuthResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt_manager.access_token_expiry_seconds(),
        user,
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Login with email and password.
///
/// Every attempt takes at least `MIN_RESPONSE_TIME` so response timing does
/// not reveal whether the e-mail exists.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    const MIN_RESPONSE_TIME: std::time::Duration = std::time::Duration::from_millis(300);
    let start = std::time::Instant::now();

    let result = login_inner(&state, &headers, &req).await;

    let elapsed = start.elapsed();
    if elapsed < MIN_RESPONSE_TIME {
        tokio::time::sleep(MIN_RESPONSE_TIME - elapsed).await;
    }

    result.map(Json)
}

async fn login_inner(state: &AppState, headers: &HeaderMap, req: &LoginRequest) -> ApiResult<AuthResponse> {
    let email = req.email.trim().to_lowercase();

    let identifier = extract_client_ip(headers).unwrap_or_else(|| email.clone());
    check_rate_limit(state.rate_limiter.check_login(&identifier).await, "login")?;

    let user = sqlx::query_as::<_, LoginRow>(
        r#"
        SELECT u.id, u.password_hash, r.name AS role, u.email, u.is_active
        FROM users u
        JOIN roles r ON r.id = u.role_id
        WHERE u.email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| {
        tracing::warn!(email = %email, "login: unknown email");
        ApiError::InvalidCredentials
    })?;

    let valid = verify_password(&req.password, &user.password_hash).map_err(|e| {
        tracing::error!(error = ?e, user_id = %user.id, "login: stored hash is unreadable");
        ApiError::Internal
    })?;

    if !valid {
        tracing::warn!(user_id = %user.id, "login: invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    if !user.is_active {
        tracing::warn!(user_id = %user.id, "login: deactivated account");
        return Err(ApiError::InvalidCredentials);
    }

    let pair = issue_session(state, user.id, &user.role, &user.email).await?;

    sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
        .bind(user.id)
        .execute(&state.pool)
        .await?;

    tracing::info!(user_id = %user.id, role = %user.role, "User logged in");
    auth_response(state, user.id, pair).await
}

/// Exchange a refresh token for a new pair. The old refresh token is revoked.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let claims = state
        .jwt_manager
        .validate_refresh_token(&req.refresh_token)
        .map_err(|_| ApiError::InvalidToken)?;

    let revoked = sqlx::query(
        r#"
        UPDATE user_sessions
        SET revoked_at = NOW()
        WHERE refresh_jti = $1 AND user_id = $2 AND revoked_at IS NULL AND expires_at > NOW()
        "#,
    )
    .bind(&claims.jti)
    .bind(claims.sub)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if revoked == 0 {
        tracing::warn!(user_id = %claims.sub, "Refresh with revoked or unknown session");
        return Err(ApiError::InvalidToken);
    }

    let user = sqlx::query_as::<_, LoginRow>(
        r#"
        SELECT u.id, u.password_hash, r.name AS role, u.email, u.is_active
        FROM users u
        JOIN roles r ON r.id = u.role_id
        WHERE u.id = $1
        "#,
    )
    .bind(claims.sub)
    .fetch_optional(&state.pool)
    .await?
    .filter(|u| u.is_active)
    .ok_or(ApiError::InvalidToken)?;

    let pair = issue_session(&state, user.id, &user.role, &user.email).await?;
    Ok(Json(auth_response(&state, user.id, pair).await?))
}

/// Current user profile
pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UserResponse>> {
    let user = sqlx::query_as::<_, UserResponse>(PROFILE_QUERY)
        .bind(auth_user.user_id)
        .fetch_one(&state.pool)
        .await?;

    Ok(Json(user))
}

/// Revoke every refresh session of the user
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MessageResponse>> {
    let revoked = sqlx::query(
        "UPDATE user_sessions SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(auth_user.user_id)
    .execute(&state.pool)
    .await?
    .rows_affected();

    tracing::info!(user_id = %auth_user.user_id, revoked_sessions = revoked, "User logged out");

    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// Change password; all sessions are revoked afterwards
pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    validate_password_strength(&req.new_password)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let current_hash: String = sqlx::query_scalar("SELECT password_hash FROM users WHERE id = $1")
        .bind(auth_user.user_id)
        .fetch_one(&state.pool)
        .await?;

    let valid = verify_password(&req.current_password, &current_hash).map_err(|_| ApiError::Internal)?;
    if !valid {
        return Err(ApiError::InvalidCredentials);
    }

    let password_hash = hash_password(&req.new_password).map_err(|_| ApiError::Internal)?;

    let mut tx = state.pool.begin().await?;
    sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
        .bind(&password_hash)
        .bind(auth_user.user_id)
        .execute(&mut *tx)
        .await?;
    let revoked = sqlx::query(
        "UPDATE user_sessions SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(auth_user.user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        revoked_sessions = revoked,
        "Password changed, sessions revoked"
    );

    Ok(Json(MessageResponse::new("Password changed successfully")))
}
