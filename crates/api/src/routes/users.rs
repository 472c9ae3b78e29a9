//! User (operator) management routes

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::UserStatus;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{double_option, MessageResponse};
use crate::{
    auth::{hash_password, validate_password_strength, AuthUser},
    error::{ApiError, ApiResult},
    services::presence,
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub role_id: Uuid,
    pub line_id: Option<Uuid>,
    pub line_position: Option<i32>,
    pub sip_extension: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub full_name: Option<String>,
    pub role_id: Option<Uuid>,
    /// `Some(None)` detaches the user from their line
    #[serde(default, with = "double_option")]
    pub line_id: Option<Option<Uuid>>,
    pub line_position: Option<i32>,
    #[serde(default, with = "double_option")]
    pub sip_extension: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    pub line_id: Option<Uuid>,
    pub status: Option<UserStatus>,
    pub include_inactive: Option<bool>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role_id: Uuid,
    pub role: String,
    pub line_id: Option<Uuid>,
    pub line_position: i32,
    pub sip_extension: Option<String>,
    pub status: UserStatus,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const USER_SELECT: &str = r#"
    SELECT u.id, u.email, u.full_name, u.role_id, r.name AS role, u.line_id, u.line_position,
           u.sip_extension, u.status, u.is_active, u.last_login_at, u.created_at
    FROM users u
    JOIN roles r ON r.id = u.role_id
"#;

async fn fetch_user(state: &AppState, user_id: Uuid) -> ApiResult<UserSummary> {
    sqlx::query_as::<_, UserSummary>(&format!("{} WHERE u.id = $1", USER_SELECT))
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(ApiError::NotFound)
}

pub(crate) fn validate_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ApiError::Validation("Invalid email address".into()))
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// List users, optionally filtered by line or status
pub async fn list_users(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Query(filter): Query<UserFilter>,
) -> ApiResult<Json<Vec<UserSummary>>> {
    let users = sqlx::query_as::<_, UserSummary>(&format!(
        r#"
        {}
        WHERE ($1::uuid IS NULL OR u.line_id = $1)
          AND ($2::varchar IS NULL OR u.status = $2)
          AND (u.is_active OR $3)
        ORDER BY u.line_id NULLS LAST, u.line_position, u.created_at
        "#,
        USER_SELECT
    ))
    .bind(filter.line_id)
    .bind(filter.status)
    .bind(filter.include_inactive.unwrap_or(false))
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(users))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<Json<UserSummary>> {
    auth_user.require_admin()?;

    let email = validate_email(&req.email)?;
    let full_name = req.full_name.trim();
    if full_name.is_empty() {
        return Err(ApiError::Validation("Full name is required".into()));
    }
    validate_password_strength(&req.password).map_err(|e| ApiError::Validation(e.to_string()))?;
    let password_hash = hash_password(&req.password).map_err(|_| ApiError::Internal)?;

    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO users (email, password_hash, full_name, role_id, line_id, line_position, sip_extension)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&email)
    .bind(&password_hash)
    .bind(full_name)
    .bind(req.role_id)
    .bind(req.line_id)
    .bind(req.line_position.unwrap_or(0))
    .bind(req.sip_extension.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %user_id, created_by = %auth_user.user_id, "User created");
    Ok(Json(fetch_user(&state, user_id).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserSummary>> {
    Ok(Json(fetch_user(&state, user_id).await?))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserSummary>> {
    auth_user.require_admin()?;
    let current = fetch_user(&state, user_id).await?;

    let full_name = match req.full_name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::Validation("Full name cannot be empty".into())),
        Some(name) => name.to_string(),
        None => current.full_name,
    };
    let sip_extension = match req.sip_extension {
        Some(ext) => ext.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        None => current.sip_extension,
    };

    sqlx::query(
        r#"
        UPDATE users
        SET full_name = $2, role_id = $3, line_id = $4, line_position = $5,
            sip_extension = $6, is_active = $7, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(&full_name)
    .bind(req.role_id.unwrap_or(current.role_id))
    .bind(req.line_id.unwrap_or(current.line_id))
    .bind(req.line_position.unwrap_or(current.line_position))
    .bind(sip_extension)
    .bind(req.is_active.unwrap_or(current.is_active))
    .execute(&state.pool)
    .await?;

    if req.is_active == Some(false) {
        revoke_sessions(&state, user_id).await?;
    }

    tracing::info!(user_id = %user_id, updated_by = %auth_user.user_id, "User updated");
    Ok(Json(fetch_user(&state, user_id).await?))
}

async fn revoke_sessions(state: &AppState, user_id: Uuid) -> ApiResult<u64> {
    let revoked = sqlx::query(
        "UPDATE user_sessions SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(user_id)
    .execute(&state.pool)
    .await?
    .rows_affected();
    Ok(revoked)
}

/// Deactivate a user. Users stay referenced by tickets, messages and
/// history, so the row is kept.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_admin()?;
    if user_id == auth_user.user_id {
        return Err(ApiError::Validation("You cannot deactivate yourself".into()));
    }

    let updated = sqlx::query(
        "UPDATE users SET is_active = FALSE, status = 'offline', updated_at = NOW() WHERE id = $1",
    )
    .bind(user_id)
    .execute(&state.pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(ApiError::NotFound);
    }

    revoke_sessions(&state, user_id).await?;
    presence::set_status(&state.pool, &state.ws_state, user_id, UserStatus::Offline).await?;

    tracing::info!(user_id = %user_id, deactivated_by = %auth_user.user_id, "User deactivated");
    Ok(Json(MessageResponse::new("User deactivated")))
}

/// Set the caller's own availability
pub async fn update_my_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<Json<UserSummary>> {
    presence::set_status(&state.pool, &state.ws_state, auth_user.user_id, req.status).await?;
    Ok(Json(fetch_user(&state, auth_user.user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert_eq!(validate_email(" Op@Example.COM ").unwrap(), "op@example.com");
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("op@localhost").is_err());
    }

    #[test]
    fn test_update_request_distinguishes_null_from_absent() {
        let req: UpdateUserRequest = serde_json::from_str(r#"{"line_id": null}"#).unwrap();
        assert_eq!(req.line_id, Some(None));

        let req: UpdateUserRequest = serde_json::from_str(r#"{"full_name": "Анна"}"#).unwrap();
        assert_eq!(req.line_id, None);
        assert_eq!(req.sip_extension, None);
    }
}
