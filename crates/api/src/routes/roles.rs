//! Role management

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::MessageResponse;
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Roles the permission model is built on; they cannot be removed
const BUILTIN_ROLES: [&str; 3] = ["admin", "supervisor", "operator"];

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct RoleResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub user_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const ROLE_SELECT: &str = r#"
    SELECT r.id, r.name, r.description,
           (SELECT COUNT(*) FROM users u WHERE u.role_id = r.id) AS user_count,
           r.created_at
    FROM roles r
"#;

fn normalize_role_name(name: &str) -> ApiResult<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::Validation("Role name must be 1-64 characters".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ApiError::Validation(
            "Role name may contain only latin letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(name)
}

pub async fn list_roles(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<RoleResponse>>> {
    let roles = sqlx::query_as::<_, RoleResponse>(&format!("{} ORDER BY r.created_at", ROLE_SELECT))
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(roles))
}

/// Custom roles carry operator permissions unless their name is a built-in level
pub async fn create_role(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateRoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    auth_user.require_admin()?;
    let name = normalize_role_name(&req.name)?;

    let role_id: Uuid =
        sqlx::query_scalar("INSERT INTO roles (name, description) VALUES ($1, $2) RETURNING id")
            .bind(&name)
            .bind(req.description.as_deref().map(str::trim))
            .fetch_one(&state.pool)
            .await?;

    tracing::info!(role_id = %role_id, name = %name, created_by = %auth_user.user_id, "Role created");

    let role = sqlx::query_as::<_, RoleResponse>(&format!("{} WHERE r.id = $1", ROLE_SELECT))
        .bind(role_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(Json(role))
}

pub async fn delete_role(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_admin()?;

    let name: String = sqlx::query_scalar("SELECT name FROM roles WHERE id = $1")
        .bind(role_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(ApiError::NotFound)?;

    if BUILTIN_ROLES.contains(&name.as_str()) {
        return Err(ApiError::Conflict(format!("Role '{}' is built in", name)));
    }

    // Users still holding the role make this a foreign-key violation (400)
    sqlx::query("DELETE FROM roles WHERE id = $1")
        .bind(role_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(role_id = %role_id, name = %name, deleted_by = %auth_user.user_id, "Role deleted");
    Ok(Json(MessageResponse::new("Role deleted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_role_name() {
        assert_eq!(normalize_role_name(" Team_Lead ").unwrap(), "team_lead");
        assert!(normalize_role_name("").is_err());
        assert!(normalize_role_name("старший").is_err());
        assert!(normalize_role_name(&"a".repeat(65)).is_err());
    }
}
