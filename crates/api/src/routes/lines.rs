//! Operator lines (groups tickets can be transferred to)

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use linedesk_shared::UserStatus;
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

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateLineRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLineRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct LineResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub operator_count: i64,
    pub online_count: i64,
    pub queued_tickets: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, FromRow)]
pub struct LineOperator {
    pub id: Uuid,
    pub full_name: String,
    pub line_position: i32,
    pub status: UserStatus,
    pub is_active: bool,
    pub open_tickets: i64,
}

const LINE_SELECT: &str = r#"
    SELECT l.id, l.name, l.description, l.is_active,
           (SELECT COUNT(*) FROM users u WHERE u.line_id = l.id AND u.is_active) AS operator_count,
           (SELECT COUNT(*) FROM users u
            WHERE u.line_id = l.id AND u.is_active AND u.status = 'online') AS online_count,
           (SELECT COUNT(*) FROM tickets t
            WHERE t.line_id = l.id AND t.assigned_to IS NULL
              AND t.status IN ('new', 'open', 'pending')) AS queued_tickets,
           l.created_at
    FROM lines l
"#;

async fn fetch_line(state: &AppState, line_id: Uuid) -> ApiResult<LineResponse> {
    sqlx::query_as::<_, LineResponse>(&format!("{} WHERE l.id = $1", LINE_SELECT))
        .bind(line_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(ApiError::NotFound)
}

fn validate_name(name: &str) -> ApiResult<&str> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 128 {
        return Err(ApiError::Validation("Line name must be 1-128 characters".into()));
    }
    Ok(name)
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_lines(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<LineResponse>>> {
    let lines = sqlx::query_as::<_, LineResponse>(&format!("{} ORDER BY l.name", LINE_SELECT))
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(lines))
}

pub async fn create_line(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateLineRequest>,
) -> ApiResult<Json<LineResponse>> {
    auth_user.require_admin()?;
    let name = validate_name(&req.name)?;

    let line_id: Uuid =
        sqlx::query_scalar("INSERT INTO lines (name, description) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(&req.description)
            .fetch_one(&state.pool)
            .await?;

    tracing::info!(line_id = %line_id, name = %name, "Line created");
    Ok(Json(fetch_line(&state, line_id).await?))
}

pub async fn get_line(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(line_id): Path<Uuid>,
) -> ApiResult<Json<LineResponse>> {
    Ok(Json(fetch_line(&state, line_id).await?))
}

pub async fn update_line(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(line_id): Path<Uuid>,
    Json(req): Json<UpdateLineRequest>,
) -> ApiResult<Json<LineResponse>> {
    auth_user.require_admin()?;
    let name = req.name.as_deref().map(validate_name).transpose()?;

    let updated = sqlx::query(
        r#"
        UPDATE lines
        SET name = COALESCE($2, name),
            description = COALESCE($3, description),
            is_active = COALESCE($4, is_active),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(line_id)
    .bind(name)
    .bind(&req.description)
    .bind(req.is_active)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(Json(fetch_line(&state, line_id).await?))
}

/// Members and queued tickets are detached (`ON DELETE SET NULL`)
pub async fn delete_line(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(line_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_admin()?;

    let deleted = sqlx::query("DELETE FROM lines WHERE id = $1")
        .bind(line_id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    tracing::info!(line_id = %line_id, deleted_by = %auth_user.user_id, "Line deleted");
    Ok(Json(MessageResponse::new("Line deleted")))
}

/// Line members in assignment order
pub async fn line_operators(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(line_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LineOperator>>> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM lines WHERE id = $1)")
        .bind(line_id)
        .fetch_one(&state.pool)
        .await?;
    if !exists {
        return Err(ApiError::NotFound);
    }

    let operators = sqlx::query_as::<_, LineOperator>(
        r#"
        SELECT u.id, u.full_name, u.line_position, u.status, u.is_active,
               (SELECT COUNT(*) FROM tickets t
                WHERE t.assigned_to = u.id AND t.status IN ('new', 'open', 'pending')) AS open_tickets
        FROM users u
        WHERE u.line_id = $1
        ORDER BY u.line_position, u.created_at
        "#,
    )
    .bind(line_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(operators))
}
