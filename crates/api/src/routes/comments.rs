//! Comments on tickets and tasks

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

const CONTENT_MAX_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct CommentRow {
    pub id: Uuid,
    pub ticket_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub author_id: Uuid,
    pub author_name: Option<String>,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const COMMENT_COLUMNS: &str = r#"
    comments.id, comments.ticket_id, comments.task_id, comments.author_id,
    (SELECT full_name FROM users WHERE users.id = comments.author_id) AS author_name,
    comments.content, comments.created_at, comments.updated_at
"#;

/// What a comment hangs off; the table allows exactly one
#[derive(Debug, Clone, Copy)]
enum Target {
    Ticket(Uuid),
    Task(Uuid),
}

impl Target {
    fn table(&self) -> &'static str {
        match self {
            Self::Ticket(_) => "tickets",
            Self::Task(_) => "tasks",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::Ticket(_) => "ticket_id",
            Self::Task(_) => "task_id",
        }
    }

    fn id(&self) -> Uuid {
        match self {
            Self::Ticket(id) | Self::Task(id) => *id,
        }
    }
}

fn validate_content(content: &str) -> ApiResult<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::Validation("Comment cannot be empty".into()));
    }
    if content.chars().count() > CONTENT_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Comment must be at most {} characters",
            CONTENT_MAX_CHARS
        )));
    }
    Ok(content)
}

async fn ensure_target(state: &AppState, target: Target) -> ApiResult<()> {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
        target.table()
    ))
    .bind(target.id())
    .fetch_one(&state.pool)
    .await?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

async fn list_for(state: &AppState, target: Target) -> ApiResult<Vec<CommentRow>> {
    ensure_target(state, target).await?;
    let comments = sqlx::query_as::<_, CommentRow>(&format!(
        "SELECT {} FROM comments WHERE {} = $1 ORDER BY created_at",
        COMMENT_COLUMNS,
        target.column()
    ))
    .bind(target.id())
    .fetch_all(&state.pool)
    .await?;
    Ok(comments)
}

async fn add_to(
    state: &AppState,
    author: &AuthUser,
    target: Target,
    req: CommentRequest,
) -> ApiResult<CommentRow> {
    let content = validate_content(&req.content)?;
    ensure_target(state, target).await?;

    let comment = sqlx::query_as::<_, CommentRow>(&format!(
        "INSERT INTO comments ({}, author_id, content) VALUES ($1, $2, $3) RETURNING {}",
        target.column(),
        COMMENT_COLUMNS
    ))
    .bind(target.id())
    .bind(author.user_id)
    .bind(content)
    .fetch_one(&state.pool)
    .await?;

    tracing::debug!(comment_id = %comment.id, target = ?target, "Comment added");
    Ok(comment)
}

/// Only the author or a supervisor may change a comment
async fn ensure_author(state: &AppState, actor: &AuthUser, comment_id: Uuid) -> ApiResult<()> {
    let author_id: Uuid = sqlx::query_scalar("SELECT author_id FROM comments WHERE id = $1")
        .bind(comment_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(ApiError::NotFound)?;

    if author_id == actor.user_id {
        Ok(())
    } else {
        actor.require_supervisor()
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_ticket_comments(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CommentRow>>> {
    Ok(Json(list_for(&state, Target::Ticket(ticket_id)).await?))
}

pub async fn add_ticket_comment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<Json<CommentRow>> {
    Ok(Json(add_to(&state, &auth_user, Target::Ticket(ticket_id), req).await?))
}

pub async fn list_task_comments(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CommentRow>>> {
    Ok(Json(list_for(&state, Target::Task(task_id)).await?))
}

pub async fn add_task_comment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<Json<CommentRow>> {
    Ok(Json(add_to(&state, &auth_user, Target::Task(task_id), req).await?))
}

pub async fn update_comment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(comment_id): Path<Uuid>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<Json<CommentRow>> {
    let content = validate_content(&req.content)?;
    ensure_author(&state, &auth_user, comment_id).await?;

    let comment = sqlx::query_as::<_, CommentRow>(&format!(
        "UPDATE comments SET content = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
        COMMENT_COLUMNS
    ))
    .bind(comment_id)
    .bind(content)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(comment))
}

pub async fn delete_comment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(comment_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    ensure_author(&state, &auth_user, comment_id).await?;

    sqlx::query("DELETE FROM comments WHERE id = $1")
        .bind(comment_id)
        .execute(&state.pool)
        .await?;

    Ok(Json(MessageResponse::new("Comment deleted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_validation() {
        assert!(validate_content(" \n ").is_err());
        assert_eq!(validate_content("  Клиент доволен  ").unwrap(), "Клиент доволен");
        assert!(validate_content(&"a".repeat(CONTENT_MAX_CHARS + 1)).is_err());
    }

    #[test]
    fn test_target_columns() {
        let id = Uuid::new_v4();
        assert_eq!(Target::Ticket(id).column(), "ticket_id");
        assert_eq!(Target::Task(id).table(), "tasks");
        assert_eq!(Target::Task(id).id(), id);
    }
}
