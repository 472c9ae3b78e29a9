//! Websocket endpoint: authentication, presence and client events

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use linedesk_shared::UserStatus;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{auth::middleware::authenticate, services::presence, state::AppState};

use super::{
    connection::Connection,
    events::{ClientEvent, ServerEvent},
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: String,
}

/// Upgrade to a websocket. Browsers cannot set headers on websocket
/// requests, so the access token travels in the query string.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, StatusCode> {
    let auth_user = authenticate(&app_state.auth_state(), &params.token)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "WebSocket auth failed");
            e.status()
        })?;

    let user_id = auth_user.user_id;
    tracing::info!(user_id = %user_id, "WebSocket connection upgrade requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, app_state)))
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let ws_state = app_state.ws_state.clone();
    let conn = ws_state.add_connection(Connection::new(user_id, tx)).await;
    let session_id = conn.session_id;

    let _ = conn.send(ServerEvent::Connected { session_id });

    // Connecting brings an offline operator online; a chosen `busy` is kept
    if let Err(e) = presence::mark_connected(&app_state.pool, &ws_state, user_id).await {
        tracing::error!(error = ?e, user_id = %user_id, "Failed to update user presence");
    }

    match presence::online_users(&app_state.pool).await {
        Ok(users) => {
            let _ = conn.send(ServerEvent::PresenceBatch { users });
        }
        Err(e) => tracing::error!(error = ?e, "Failed to fetch presence batch"),
    }

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Failed to serialize WebSocket event"),
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_client_event(event, &conn, &app_state).await,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to parse client event");
                    let _ = conn.send(ServerEvent::Error {
                        message: "Invalid event format".to_string(),
                    });
                }
            },
            Message::Close(_) => {
                tracing::info!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            // Axum answers pings itself; binary frames are not used
            _ => {}
        }
    }

    // Another tab may still be open
    if ws_state.remove_connection(&conn).await {
        if let Err(e) =
            presence::set_status(&app_state.pool, &ws_state, user_id, UserStatus::Offline).await
        {
            tracing::error!(error = ?e, user_id = %user_id, "Failed to update user presence on disconnect");
        }
    }

    send_task.abort();
}

async fn handle_client_event(event: ClientEvent, conn: &Arc<Connection>, app_state: &AppState) {
    let ws_state = &app_state.ws_state;

    match event {
        ClientEvent::Subscribe { client_id } => {
            match client_exists(&app_state.pool, client_id).await {
                Ok(true) => ws_state.rooms.join(client_id, conn).await,
                Ok(false) => {
                    let _ = conn.send(ServerEvent::Error {
                        message: "Client not found".to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to verify client");
                    let _ = conn.send(ServerEvent::Error {
                        message: "Failed to subscribe".to_string(),
                    });
                }
            }
        }

        ClientEvent::Unsubscribe { client_id } => {
            ws_state.rooms.leave(&client_id, conn).await;
        }

        ClientEvent::Ping => {
            let _ = conn.send(ServerEvent::Pong);
        }

        ClientEvent::SetStatus { status } => {
            if let Err(e) = presence::set_status(&app_state.pool, ws_state, conn.user_id, status).await {
                tracing::error!(error = ?e, user_id = %conn.user_id, "Failed to update presence");
                let _ = conn.send(ServerEvent::Error {
                    message: "Failed to update status".to_string(),
                });
            }
        }
    }
}

async fn client_exists(pool: &PgPool, client_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(client_id)
    .fetch_one(pool)
    .await
}
