//! Unified per-client chat across WhatsApp, Telegram and Instagram

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::Channel;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::inbox::{self, MessageRow, OutboundRequest, MESSAGE_COLUMNS},
    state::AppState,
    websocket::events::ServerEvent,
};

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub channel: Option<Channel>,
    /// Only messages strictly older than this (RFC 3339), for scrolling back
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub before: Option<OffsetDateTime>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub channel: Channel,
    #[serde(default)]
    pub content: String,
    pub media_file_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub marked: u64,
}

#[derive(Debug, Serialize, FromRow)]
pub struct UnreadCount {
    pub client_id: Uuid,
    pub client_name: String,
    pub unread: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
}

async fn ensure_client(state: &AppState, client_id: Uuid) -> ApiResult<()> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(client_id)
    .fetch_one(&state.pool)
    .await?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

/// Chat history, oldest first within the returned page
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<MessageRow>>> {
    ensure_client(&state, client_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let mut messages = sqlx::query_as::<_, MessageRow>(&format!(
        r#"
        SELECT {}
        FROM messages
        WHERE client_id = $1
          AND ($2::varchar IS NULL OR channel = $2)
          AND ($3::timestamptz IS NULL OR created_at < $3)
        ORDER BY created_at DESC
        LIMIT $4
        "#,
        MESSAGE_COLUMNS
    ))
    .bind(client_id)
    .bind(query.channel)
    .bind(query.before)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    messages.reverse();
    Ok(Json(messages))
}

/// Send through the chosen channel. A provider rejection still returns 200
/// with the stored `failed` message.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<MessageRow>> {
    let message = inbox::send_outbound(
        &state,
        OutboundRequest {
            client_id,
            channel: req.channel,
            content: req.content,
            media_file_id: req.media_file_id,
            ticket_id: req.ticket_id,
            sender_id: Some(auth_user.user_id),
            is_ai_generated: false,
        },
    )
    .await?;

    Ok(Json(message))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<MarkReadResponse>> {
    ensure_client(&state, client_id).await?;

    let marked = sqlx::query(
        r#"
        UPDATE messages SET is_read = TRUE
        WHERE client_id = $1 AND direction = 'inbound' AND NOT is_read
        "#,
    )
    .bind(client_id)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if marked > 0 {
        state
            .ws_state
            .broadcast_all(ServerEvent::MessagesRead { client_id, marked })
            .await;
    }

    Ok(Json(MarkReadResponse { marked }))
}

/// Clients with unread inbound messages, newest activity first
pub async fn unread_counts(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<UnreadCount>>> {
    let counts = sqlx::query_as::<_, UnreadCount>(
        r#"
        SELECT m.client_id, c.full_name AS client_name,
               COUNT(*) AS unread, MAX(m.created_at) AS last_message_at
        FROM messages m
        JOIN clients c ON c.id = m.client_id AND c.deleted_at IS NULL
        WHERE m.direction = 'inbound' AND NOT m.is_read
        GROUP BY m.client_id, c.full_name
        ORDER BY last_message_at DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_parses_cursor() {
        let uri: axum::http::Uri = "/messages?channel=telegram&before=2024-06-01T10%3A00%3A00Z&limit=20"
            .parse()
            .unwrap();
        let Query(query) = Query::<HistoryQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(query.channel, Some(Channel::Telegram));
        assert_eq!(query.limit, Some(20));
        assert_eq!(query.before.unwrap().unix_timestamp(), 1_717_236_000);

        let uri: axum::http::Uri = "/messages".parse().unwrap();
        let Query(empty) = Query::<HistoryQuery>::try_from_uri(&uri).unwrap();
        assert!(empty.before.is_none());
    }

    #[test]
    fn test_send_request_allows_media_only() {
        let req: SendMessageRequest = serde_json::from_str(
            r#"{"channel": "whatsapp", "media_file_id": "550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .unwrap();
        assert!(req.content.is_empty());
        assert!(req.media_file_id.is_some());
    }
}
