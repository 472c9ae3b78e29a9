//! Canned answers for operators

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    double_option,
    media::{fetch_media, MediaFile},
    MessageResponse,
};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const TITLE_MAX_CHARS: usize = 255;

#[derive(Debug, Serialize, FromRow)]
pub struct QuickReply {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub media_file_id: Option<Uuid>,
    pub usage_count: i32,
    pub is_shared: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const QUICK_REPLY_COLUMNS: &str = r#"
    id, title, content, category, media_file_id, usage_count, is_shared,
    created_by, created_at, updated_at
"#;

#[derive(Debug, Serialize)]
pub struct QuickReplyWithMedia {
    #[serde(flatten)]
    pub reply: QuickReply,
    pub media: Option<MediaFile>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuickReplyFilter {
    pub category: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateQuickReplyRequest {
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub media_file_id: Option<Uuid>,
    pub is_shared: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuickReplyRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default, with = "double_option")]
    pub category: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub media_file_id: Option<Option<Uuid>>,
    pub is_shared: Option<bool>,
}

fn validate_title(title: &str) -> ApiResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::Validation("Title is required".into()));
    }
    if title.chars().count() > TITLE_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Title must be at most {} characters",
            TITLE_MAX_CHARS
        )));
    }
    Ok(title.to_string())
}

fn validate_content(content: &str) -> ApiResult<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::Validation("Content is required".into()));
    }
    Ok(content.to_string())
}

fn clean_category(category: Option<String>) -> Option<String> {
    category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

/// Shared replies are visible to everybody, private ones only to the author
async fn fetch_visible(state: &AppState, user: &AuthUser, reply_id: Uuid) -> ApiResult<QuickReply> {
    sqlx::query_as::<_, QuickReply>(&format!(
        "SELECT {} FROM quick_replies WHERE id = $1 AND (is_shared OR created_by = $2)",
        QUICK_REPLY_COLUMNS
    ))
    .bind(reply_id)
    .bind(user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)
}

fn ensure_owner(user: &AuthUser, reply: &QuickReply) -> ApiResult<()> {
    if reply.created_by == user.user_id {
        Ok(())
    } else {
        user.require_supervisor()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Most used first
pub async fn list_quick_replies(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(filter): Query<QuickReplyFilter>,
) -> ApiResult<Json<Vec<QuickReply>>> {
    let pattern = filter
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")));

    let replies = sqlx::query_as::<_, QuickReply>(&format!(
        r#"
        SELECT {} FROM quick_replies
        WHERE (is_shared OR created_by = $1)
          AND ($2::varchar IS NULL OR category = $2)
          AND ($3::text IS NULL OR title ILIKE $3 OR content ILIKE $3)
        ORDER BY usage_count DESC, title
        "#,
        QUICK_REPLY_COLUMNS
    ))
    .bind(auth_user.user_id)
    .bind(clean_category(filter.category))
    .bind(&pattern)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(replies))
}

pub async fn create_quick_reply(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateQuickReplyRequest>,
) -> ApiResult<Json<QuickReply>> {
    let title = validate_title(&req.title)?;
    let content = validate_content(&req.content)?;
    if let Some(media_id) = req.media_file_id {
        fetch_media(&state.pool, media_id).await?;
    }

    let reply = sqlx::query_as::<_, QuickReply>(&format!(
        r#"
        INSERT INTO quick_replies (title, content, category, media_file_id, is_shared, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        QUICK_REPLY_COLUMNS
    ))
    .bind(&title)
    .bind(&content)
    .bind(clean_category(req.category))
    .bind(req.media_file_id)
    .bind(req.is_shared.unwrap_or(true))
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(reply))
}

pub async fn update_quick_reply(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(reply_id): Path<Uuid>,
    Json(req): Json<UpdateQuickReplyRequest>,
) -> ApiResult<Json<QuickReply>> {
    let current = fetch_visible(&state, &auth_user, reply_id).await?;
    ensure_owner(&auth_user, &current)?;

    let title = match req.title {
        Some(t) => validate_title(&t)?,
        None => current.title,
    };
    let content = match req.content {
        Some(c) => validate_content(&c)?,
        None => current.content,
    };
    let category = match req.category {
        Some(c) => clean_category(c),
        None => current.category,
    };
    let media_file_id = req.media_file_id.unwrap_or(current.media_file_id);
    if let Some(media_id) = media_file_id {
        fetch_media(&state.pool, media_id).await?;
    }

    let reply = sqlx::query_as::<_, QuickReply>(&format!(
        r#"
        UPDATE quick_replies
        SET title = $2, content = $3, category = $4, media_file_id = $5,
            is_shared = $6, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        QUICK_REPLY_COLUMNS
    ))
    .bind(reply_id)
    .bind(&title)
    .bind(&content)
    .bind(&category)
    .bind(media_file_id)
    .bind(req.is_shared.unwrap_or(current.is_shared))
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(reply))
}

pub async fn delete_quick_reply(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(reply_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    let current = fetch_visible(&state, &auth_user, reply_id).await?;
    ensure_owner(&auth_user, &current)?;

    sqlx::query("DELETE FROM quick_replies WHERE id = $1")
        .bind(reply_id)
        .execute(&state.pool)
        .await?;

    Ok(Json(MessageResponse::new("Quick reply deleted")))
}

/// Count one use and hand the reply back with its attachment
pub async fn use_quick_reply(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(reply_id): Path<Uuid>,
) -> ApiResult<Json<QuickReplyWithMedia>> {
    let reply = sqlx::query_as::<_, QuickReply>(&format!(
        r#"
        UPDATE quick_replies
        SET usage_count = usage_count + 1
        WHERE id = $1 AND (is_shared OR created_by = $2)
        RETURNING {}
        "#,
        QUICK_REPLY_COLUMNS
    ))
    .bind(reply_id)
    .bind(auth_user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)?;

    let media = match reply.media_file_id {
        Some(media_id) => match fetch_media(&state.pool, media_id).await {
            Ok(media) => Some(media),
            Err(ApiError::NotFound) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };

    tracing::debug!(reply_id = %reply.id, usage_count = reply.usage_count, "Quick reply used");
    Ok(Json(QuickReplyWithMedia { reply, media }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_and_content_validation() {
        assert_eq!(validate_title("  Приветствие ").unwrap(), "Приветствие");
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"я".repeat(TITLE_MAX_CHARS + 1)).is_err());
        assert!(validate_content("\t").is_err());
    }

    #[test]
    fn test_clean_category() {
        assert_eq!(clean_category(Some(" billing ".into())), Some("billing".into()));
        assert_eq!(clean_category(Some("  ".into())), None);
        assert_eq!(clean_category(None), None);
    }

    #[test]
    fn test_update_distinguishes_null_from_absent() {
        let req: UpdateQuickReplyRequest =
            serde_json::from_str(r#"{"category": null}"#).unwrap();
        assert_eq!(req.category, Some(None));
        assert_eq!(req.media_file_id, None);

        let req: UpdateQuickReplyRequest = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(req.category, None);
    }
}
