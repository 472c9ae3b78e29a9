//! Per-user notifications, stored and pushed over websocket

use linedesk_shared::NotificationKind;
use serde::Serialize;
use sqlx::{FromRow, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::websocket::{
    events::{NotificationEvent, ServerEvent},
    WebSocketState,
};

/// What the notification points at
#[derive(Debug, Clone, Copy)]
pub enum NotificationTarget {
    Ticket(Uuid),
    Task(Uuid),
    Client(Uuid),
}

impl NotificationTarget {
    fn parts(&self) -> (&'static str, Uuid) {
        match self {
            Self::Ticket(id) => ("ticket", *id),
            Self::Task(id) => ("task", *id),
            Self::Client(id) => ("client", *id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub target: Option<NotificationTarget>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&NotificationRow> for NotificationEvent {
    fn from(row: &NotificationRow) -> Self {
        Self {
            id: row.id,
            kind: serde_json::to_value(row.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            title: row.title.clone(),
            body: row.body.clone(),
            entity_type: row.entity_type.clone(),
            entity_id: row.entity_id,
            created_at: row.created_at,
        }
    }
}

/// Insert a notification row
pub async fn store<'e>(
    executor: impl PgExecutor<'e>,
    new: &NewNotification,
) -> Result<NotificationRow, sqlx::Error> {
    let (entity_type, entity_id) = match new.target.map(|t| t.parts()) {
        Some((t, id)) => (Some(t), Some(id)),
        None => (None, None),
    };

    sqlx::query_as::<_, NotificationRow>(
        r#"
        INSERT INTO notifications (user_id, kind, title, body, entity_type, entity_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, user_id, kind, title, body, entity_type, entity_id, is_read, created_at
        "#,
    )
    .bind(new.user_id)
    .bind(new.kind)
    .bind(&new.title)
    .bind(&new.body)
    .bind(entity_type)
    .bind(entity_id)
    .fetch_one(executor)
    .await
}

/// Push a stored notification to the user's live connections
pub async fn push(ws: &WebSocketState, row: &NotificationRow) {
    ws.send_to_user(
        &row.user_id,
        ServerEvent::Notification {
            notification: row.into(),
        },
    )
    .await;
}

/// Store and push. Failures are logged, never propagated: a lost
/// notification must not fail the action that caused it.
pub async fn notify<'e>(
    executor: impl PgExecutor<'e>,
    ws: Option<&WebSocketState>,
    new: NewNotification,
) {
    match store(executor, &new).await {
        Ok(row) => {
            if let Some(ws) = ws {
                push(ws, &row).await;
            }
        }
        Err(e) => {
            tracing::error!(error = ?e, user_id = %new.user_id, kind = ?new.kind, "Failed to store notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_uses_snake_case_kind() {
        let row = NotificationRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: NotificationKind::TicketTransferred,
            title: "Ticket #12 transferred to you".into(),
            body: String::new(),
            entity_type: Some("ticket".into()),
            entity_id: Some(Uuid::new_v4()),
            is_read: false,
            created_at: OffsetDateTime::now_utc(),
        };

        let event = NotificationEvent::from(&row);
        assert_eq!(event.kind, "ticket_transferred");
        assert_eq!(event.entity_type.as_deref(), Some("ticket"));
    }

    #[test]
    fn test_target_parts() {
        let id = Uuid::new_v4();
        assert_eq!(NotificationTarget::Task(id).parts(), ("task", id));
        assert_eq!(NotificationTarget::Client(id).parts(), ("client", id));
    }
}
