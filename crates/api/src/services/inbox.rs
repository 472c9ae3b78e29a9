//! Unified inbox: inbound webhook messages, outbound sends and AI auto-replies
//!
//! Every channel ends up in the same `messages` table keyed by client, so
//! the chat of a client reads as one conversation regardless of messenger.

use linedesk_shared::{
    workflow::normalize_phone,
    Channel, MessageDirection, MessageStatus, NotificationKind, TicketStatus,
};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::notifications::{self, NewNotification, NotificationTarget};
use crate::{
    ai_agent::{ChatRole, ChatTurn},
    channels::{ChannelError, InboundMessage, OutboundMedia},
    error::{ApiError, ApiResult},
    state::AppState,
    websocket::events::{ChatMessageEvent, ServerEvent},
};

/// Messages handed to the AI agent as conversation context
pub const AI_CONTEXT_MESSAGES: i64 = 20;

const NOTIFICATION_PREVIEW_CHARS: usize = 200;

pub const MESSAGE_COLUMNS: &str = r#"
    id, client_id, ticket_id, channel, direction, content, media_file_id, media_url,
    external_id, sender_id, is_ai_generated, status, is_read, error, created_at
"#;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub ticket_id: Option<Uuid>,
    pub channel: Channel,
    pub direction: MessageDirection,
    pub content: String,
    pub media_file_id: Option<Uuid>,
    pub media_url: Option<String>,
    pub external_id: Option<String>,
    pub sender_id: Option<Uuid>,
    pub is_ai_generated: bool,
    pub status: MessageStatus,
    pub is_read: bool,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl MessageRow {
    pub fn event(&self) -> ServerEvent {
        ServerEvent::NewMessage {
            client_id: self.client_id,
            message: ChatMessageEvent {
                id: self.id,
                ticket_id: self.ticket_id,
                channel: self.channel,
                direction: self.direction,
                status: self.status,
                content: self.content.clone(),
                sender_id: self.sender_id,
                is_ai_generated: self.is_ai_generated,
                created_at: self.created_at,
            },
        }
    }
}

/// Column of `clients` holding the identity for a channel
fn identity_column(channel: Channel) -> &'static str {
    match channel {
        Channel::Whatsapp => "whatsapp_phone",
        Channel::Telegram => "telegram_chat_id",
        Channel::Instagram => "instagram_id",
    }
}

/// Canonical form of a sender identity. WhatsApp ids are phone numbers.
pub fn normalize_identity(channel: Channel, raw: &str) -> String {
    match channel {
        Channel::Whatsapp => normalize_phone(raw),
        Channel::Telegram | Channel::Instagram => raw.trim().to_string(),
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(NOTIFICATION_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

// =============================================================================
// Inbound
// =============================================================================

#[derive(Debug)]
pub enum IngestOutcome {
    Stored(MessageRow),
    /// The provider redelivered a message we already have
    Duplicate,
}

#[derive(FromRow)]
struct ClientMatch {
    id: Uuid,
    full_name: String,
    assigned_to: Option<Uuid>,
}

async fn find_or_create_client(
    conn: &mut PgConnection,
    inbound: &InboundMessage,
    identity: &str,
) -> ApiResult<ClientMatch> {
    let column = identity_column(inbound.channel);

    let existing = sqlx::query_as::<_, ClientMatch>(&format!(
        "SELECT id, full_name, assigned_to FROM clients WHERE {} = $1 AND deleted_at IS NULL",
        column
    ))
    .bind(identity)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(client) = existing {
        return Ok(client);
    }

    let full_name = inbound
        .sender_name
        .clone()
        .or_else(|| inbound.sender_username.clone())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| identity.to_string());

    // WhatsApp ids double as the client's phone number
    let phone = (inbound.channel == Channel::Whatsapp).then(|| identity.to_string());
    let username_column = match inbound.channel {
        Channel::Telegram => "telegram_username",
        Channel::Instagram => "instagram_username",
        Channel::Whatsapp => "whatsapp_phone",
    };
    let username = match inbound.channel {
        Channel::Whatsapp => Some(identity.to_string()),
        _ => inbound.sender_username.clone(),
    };

    let sql = if username_column == column {
        format!(
            r#"
            INSERT INTO clients (full_name, phone, {})
            VALUES ($1, $2, $3)
            RETURNING id, full_name, assigned_to
            "#,
            column
        )
    } else {
        format!(
            r#"
            INSERT INTO clients (full_name, phone, {}, {})
            VALUES ($1, $2, $3, $4)
            RETURNING id, full_name, assigned_to
            "#,
            column, username_column
        )
    };

    let mut query = sqlx::query_as::<_, ClientMatch>(&sql)
        .bind(&full_name)
        .bind(phone)
        .bind(identity);
    if username_column != column {
        query = query.bind(username);
    }
    let client = query.fetch_one(&mut *conn).await?;

    tracing::info!(
        client_id = %client.id,
        channel = %inbound.channel,
        "Created client from inbound message"
    );
    Ok(client)
}

#[derive(FromRow)]
struct OpenTicket {
    id: Uuid,
    status: TicketStatus,
    assigned_to: Option<Uuid>,
}

/// Latest ticket of the client that is not closed; a resolved one is reopened
async fn conversation_ticket(
    conn: &mut PgConnection,
    client_id: Uuid,
) -> ApiResult<Option<(OpenTicket, bool)>> {
    let ticket = sqlx::query_as::<_, OpenTicket>(
        r#"
        SELECT id, status, assigned_to
        FROM tickets
        WHERE client_id = $1 AND status <> 'closed'
        ORDER BY created_at DESC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(client_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut ticket) = ticket else {
        return Ok(None);
    };

    if ticket.status != TicketStatus::Resolved {
        return Ok(Some((ticket, false)));
    }

    sqlx::query(
        r#"
        UPDATE tickets
        SET status = 'open', resolved_at = NULL, closed_at = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(ticket.id)
    .execute(&mut *conn)
    .await?;

    ticket.status = TicketStatus::Open;
    Ok(Some((ticket, true)))
}

/// Store a message received from a channel webhook
pub async fn ingest_inbound(state: &AppState, inbound: InboundMessage) -> ApiResult<IngestOutcome> {
    let identity = normalize_identity(inbound.channel, &inbound.sender_id);
    if identity.is_empty() {
        return Err(ApiError::Validation("Sender identity is empty".into()));
    }

    let already_stored: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE channel = $1 AND external_id = $2)",
    )
    .bind(inbound.channel)
    .bind(&inbound.external_id)
    .fetch_one(&state.pool)
    .await?;
    if already_stored {
        tracing::debug!(channel = %inbound.channel, external_id = %inbound.external_id, "Duplicate inbound message");
        return Ok(IngestOutcome::Duplicate);
    }

    let mut tx = state.pool.begin().await?;
    let client = find_or_create_client(&mut tx, &inbound, &identity).await?;
    let ticket = conversation_ticket(&mut tx, client.id).await?;

    let message = sqlx::query_as::<_, MessageRow>(&format!(
        r#"
        INSERT INTO messages (client_id, ticket_id, channel, direction, content, external_id, status, created_at)
        VALUES ($1, $2, $3, 'inbound', $4, $5, 'received', $6)
        ON CONFLICT (channel, external_id) WHERE external_id IS NOT NULL DO NOTHING
        RETURNING {}
        "#,
        MESSAGE_COLUMNS
    ))
    .bind(client.id)
    .bind(ticket.as_ref().map(|(t, _)| t.id))
    .bind(inbound.channel)
    .bind(&inbound.content)
    .bind(&inbound.external_id)
    .bind(inbound.received_at)
    .fetch_optional(&mut *tx)
    .await?;

    // Lost a race against a concurrent redelivery
    let Some(message) = message else {
        tx.rollback().await?;
        return Ok(IngestOutcome::Duplicate);
    };

    let recipient = ticket
        .as_ref()
        .and_then(|(t, _)| t.assigned_to)
        .or(client.assigned_to);
    let notification = match recipient {
        Some(user_id) => Some(
            notifications::store(
                &mut *tx,
                &NewNotification {
                    user_id,
                    kind: NotificationKind::NewMessage,
                    title: format!("New {} message from {}", inbound.channel, client.full_name),
                    body: preview(&message.content),
                    target: Some(match &ticket {
                        Some((t, _)) => NotificationTarget::Ticket(t.id),
                        None => NotificationTarget::Client(client.id),
                    }),
                },
            )
            .await?,
        ),
        None => None,
    };

    tx.commit().await?;

    if let Some(row) = &notification {
        notifications::push(&state.ws_state, row).await;
    }
    if let Some((t, true)) = &ticket {
        state
            .ws_state
            .broadcast_client(
                &client.id,
                ServerEvent::TicketUpdated {
                    ticket_id: t.id,
                    client_id: client.id,
                    status: t.status,
                    assigned_to: t.assigned_to,
                    stage_id: None,
                },
            )
            .await;
        tracing::info!(ticket_id = %t.id, client_id = %client.id, "Resolved ticket reopened by client message");
    }
    state.ws_state.broadcast_client(&client.id, message.event()).await;

    tracing::info!(
        message_id = %message.id,
        client_id = %client.id,
        channel = %message.channel,
        ticket_id = ?message.ticket_id,
        "Inbound message stored"
    );

    if state.config.ai_autoreply_enabled() && ai_enabled_for(&state.pool, client.id).await? {
        let state = state.clone();
        let (client_id, channel, ticket_id) = (client.id, message.channel, message.ticket_id);
        tokio::spawn(async move {
            if let Err(e) = auto_reply(&state, client_id, channel, ticket_id).await {
                tracing::warn!(error = %e, client_id = %client_id, "AI auto-reply failed");
            }
        });
    }

    Ok(IngestOutcome::Stored(message))
}

// =============================================================================
// Outbound
// =============================================================================

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub client_id: Uuid,
    pub channel: Channel,
    pub content: String,
    pub media_file_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    /// `None` for messages sent by the system (AI agent, campaigns)
    pub sender_id: Option<Uuid>,
    pub is_ai_generated: bool,
}

#[derive(FromRow)]
struct ClientIdentities {
    whatsapp_phone: Option<String>,
    telegram_chat_id: Option<String>,
    instagram_id: Option<String>,
}

impl ClientIdentities {
    fn for_channel(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Whatsapp => self.whatsapp_phone.as_deref(),
            Channel::Telegram => self.telegram_chat_id.as_deref(),
            Channel::Instagram => self.instagram_id.as_deref(),
        }
        .filter(|v| !v.is_empty())
    }
}

async fn load_media(pool: &PgPool, media_file_id: Uuid) -> ApiResult<OutboundMedia> {
    let (file_name, mime_type, storage_path): (String, String, String) = sqlx::query_as(
        "SELECT original_name, mime_type, storage_path FROM media_files WHERE id = $1",
    )
    .bind(media_file_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::Validation("Media file does not exist".into()))?;

    let bytes = tokio::fs::read(&storage_path).await.map_err(|e| {
        tracing::error!(error = %e, path = %storage_path, "Failed to read media file");
        ApiError::Internal
    })?;

    Ok(OutboundMedia {
        file_name,
        mime_type,
        bytes,
    })
}

/// Send a message to a client and record the attempt.
///
/// A provider failure is stored as a `failed` message and returned as such;
/// only a missing identity or an unconfigured channel is an error.
pub async fn send_outbound(state: &AppState, req: OutboundRequest) -> ApiResult<MessageRow> {
    let content = req.content.trim().to_string();
    if content.is_empty() && req.media_file_id.is_none() {
        return Err(ApiError::Validation("Message content is required".into()));
    }

    let identities = sqlx::query_as::<_, ClientIdentities>(
        r#"
        SELECT whatsapp_phone, telegram_chat_id, instagram_id
        FROM clients
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(req.client_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)?;

    let recipient = identities
        .for_channel(req.channel)
        .ok_or_else(|| ApiError::ClientChannelMissing(req.channel.to_string()))?
        .to_string();

    let sender = state.channels.sender(req.channel);
    if !sender.is_configured() {
        return Err(ChannelError::NotConfigured(req.channel).into());
    }

    let media = match req.media_file_id {
        Some(id) => Some(load_media(&state.pool, id).await?),
        None => None,
    };

    let ticket_id = match req.ticket_id {
        Some(id) => Some(id),
        None => sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM tickets
            WHERE client_id = $1 AND status <> 'closed'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(req.client_id)
        .fetch_optional(&state.pool)
        .await?,
    };

    let result = match &media {
        Some(media) => {
            let caption = Some(content.as_str()).filter(|c| !c.is_empty());
            sender.send_media(&recipient, media, caption).await
        }
        None => sender.send_text(&recipient, &content).await,
    };

    let (status, external_id, error) = match result {
        Ok(sent) => (MessageStatus::Sent, Some(sent.external_id), None),
        Err(e) => {
            tracing::warn!(
                client_id = %req.client_id,
                channel = %req.channel,
                error = %e,
                "Outbound message failed"
            );
            (MessageStatus::Failed, None, Some(e.to_string()))
        }
    };

    let message = sqlx::query_as::<_, MessageRow>(&format!(
        r#"
        INSERT INTO messages (client_id, ticket_id, channel, direction, content, media_file_id,
                              external_id, sender_id, is_ai_generated, status, is_read, error)
        VALUES ($1, $2, $3, 'outbound', $4, $5, $6, $7, $8, $9, TRUE, $10)
        RETURNING {}
        "#,
        MESSAGE_COLUMNS
    ))
    .bind(req.client_id)
    .bind(ticket_id)
    .bind(req.channel)
    .bind(&content)
    .bind(req.media_file_id)
    .bind(external_id)
    .bind(req.sender_id)
    .bind(req.is_ai_generated)
    .bind(status)
    .bind(error)
    .fetch_one(&state.pool)
    .await?;

    state
        .ws_state
        .broadcast_client(&req.client_id, message.event())
        .await;

    tracing::info!(
        message_id = %message.id,
        client_id = %req.client_id,
        channel = %req.channel,
        status = ?message.status,
        ai = req.is_ai_generated,
        "Outbound message recorded"
    );

    Ok(message)
}

// =============================================================================
// AI auto-reply
// =============================================================================

async fn ai_enabled_for(pool: &PgPool, client_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM ai_settings WHERE client_id = $1 AND is_enabled)",
    )
    .bind(client_id)
    .fetch_one(pool)
    .await
}

/// Conversation turns for the agent, oldest first
fn history_turns(messages: &[(MessageDirection, String)]) -> Vec<ChatTurn> {
    messages
        .iter()
        .filter(|(_, content)| !content.trim().is_empty())
        .map(|(direction, content)| {
            let role = match direction {
                MessageDirection::Inbound => ChatRole::User,
                MessageDirection::Outbound => ChatRole::Assistant,
            };
            ChatTurn::new(role, content.clone())
        })
        .collect()
}

/// Ask the AI agent for a reply to the client's conversation and send it.
/// Returns `None` when the client's AI setting is off.
pub async fn auto_reply(
    state: &AppState,
    client_id: Uuid,
    channel: Channel,
    ticket_id: Option<Uuid>,
) -> ApiResult<Option<MessageRow>> {
    let setting: Option<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT prompt, model FROM ai_settings WHERE client_id = $1 AND is_enabled",
    )
    .bind(client_id)
    .fetch_optional(&state.pool)
    .await?;

    let Some((prompt, model)) = setting else {
        return Ok(None);
    };

    let mut recent: Vec<(MessageDirection, String)> = sqlx::query_as(
        r#"
        SELECT direction, content FROM messages
        WHERE client_id = $1 AND status <> 'failed'
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(client_id)
    .bind(AI_CONTEXT_MESSAGES)
    .fetch_all(&state.pool)
    .await?;
    recent.reverse();

    let reply = state
        .ai_agent
        .reply(&history_turns(&recent), prompt.as_deref(), model.as_deref())
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, client_id = %client_id, "AI agent request failed");
            ApiError::ServiceUnavailable
        })?;

    let message = send_outbound(
        state,
        OutboundRequest {
            client_id,
            channel,
            content: reply,
            media_file_id: None,
            ticket_id,
            sender_id: None,
            is_ai_generated: true,
        },
    )
    .await?;

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_identity() {
        assert_eq!(
            normalize_identity(Channel::Whatsapp, "+7 (916) 123-45-67"),
            "79161234567"
        );
        assert_eq!(normalize_identity(Channel::Whatsapp, "89161234567"), "79161234567");
        assert_eq!(normalize_identity(Channel::Telegram, " 123456 "), "123456");
        assert_eq!(normalize_identity(Channel::Instagram, "1784"), "1784");
    }

    #[test]
    fn test_identity_column() {
        assert_eq!(identity_column(Channel::Whatsapp), "whatsapp_phone");
        assert_eq!(identity_column(Channel::Telegram), "telegram_chat_id");
        assert_eq!(identity_column(Channel::Instagram), "instagram_id");
    }

    #[test]
    fn test_preview_truncates_long_messages() {
        assert_eq!(preview("short"), "short");

        let long = "ж".repeat(250);
        let p = preview(&long);
        assert_eq!(p.chars().count(), NOTIFICATION_PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn test_history_turns_maps_direction_and_skips_empty() {
        let turns = history_turns(&[
            (MessageDirection::Inbound, "Здравствуйте, где мой заказ?".into()),
            (MessageDirection::Outbound, "  ".into()),
            (MessageDirection::Outbound, "Проверяю, минуту".into()),
        ]);

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::User);
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(turns[1].content, "Проверяю, минуту");
    }

    #[test]
    fn test_client_identities_for_channel() {
        let ids = ClientIdentities {
            whatsapp_phone: Some("79161234567".into()),
            telegram_chat_id: Some(String::new()),
            instagram_id: None,
        };

        assert_eq!(ids.for_channel(Channel::Whatsapp), Some("79161234567"));
        assert_eq!(ids.for_channel(Channel::Telegram), None);
        assert_eq!(ids.for_channel(Channel::Instagram), None);
    }
}
