//! The caller's notification feed

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{PageParams, PaginatedResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::notifications::NotificationRow,
    state::AppState,
};

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, body, entity_type, entity_id, is_read, created_at";

#[derive(Debug, Default, Deserialize)]
pub struct NotificationFilter {
    /// Only unread notifications
    pub unread: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct NotificationFeed {
    #[serde(flatten)]
    pub page: PaginatedResponse<NotificationRow>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct MarkedResponse {
    pub marked: u64,
}

/// Newest first
pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(filter): Query<NotificationFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<NotificationFeed>> {
    let unread_only = filter.unread.unwrap_or(false);

    let (total, unread_count): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FILTER (WHERE NOT $2 OR NOT is_read),
               COUNT(*) FILTER (WHERE NOT is_read)
        FROM notifications
        WHERE user_id = $1
        "#,
    )
    .bind(auth_user.user_id)
    .bind(unread_only)
    .fetch_one(&state.pool)
    .await?;

    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        r#"
        SELECT {} FROM notifications
        WHERE user_id = $1 AND (NOT $2 OR NOT is_read)
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#,
        NOTIFICATION_COLUMNS
    ))
    .bind(auth_user.user_id)
    .bind(unread_only)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(NotificationFeed {
        page: PaginatedResponse::from_params(rows, total, &page),
        unread_count,
    }))
}

/// Only the owner can mark a notification; others get 404
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<Json<NotificationRow>> {
    let row = sqlx::query_as::<_, NotificationRow>(&format!(
        "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2 RETURNING {}",
        NOTIFICATION_COLUMNS
    ))
    .bind(notification_id)
    .bind(auth_user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)?;

    Ok(Json(row))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MarkedResponse>> {
    let result =
        sqlx::query("UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND NOT is_read")
            .bind(auth_user.user_id)
            .execute(&state.pool)
            .await?;

    Ok(Json(MarkedResponse {
        marked: result.rows_affected(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_all() {
        let filter: NotificationFilter = serde_json::from_str("{}").unwrap();
        assert!(!filter.unread.unwrap_or(false));
    }

    #[test]
    fn test_feed_flattens_page() {
        let feed = NotificationFeed {
            page: PaginatedResponse::new(Vec::new(), 0, 1, 50),
            unread_count: 3,
        };
        let json = serde_json::to_value(&feed).unwrap();
        assert_eq!(json["unread_count"], 3);
        assert!(json["data"].as_array().unwrap().is_empty());
    }
}
