//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization.

use linedesk_shared::{Channel, MessageDirection, MessageStatus, TicketStatus, UserStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Follow a client's unified chat
    Subscribe { client_id: Uuid },

    /// Stop following a client's chat
    Unsubscribe { client_id: Uuid },

    /// Heartbeat ping to keep connection alive
    Ping,

    /// Change own availability
    SetStatus { status: UserStatus },
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Message added to a client's chat
    NewMessage {
        client_id: Uuid,
        message: ChatMessageEvent,
    },

    /// An operator read the client's inbound messages
    MessagesRead { client_id: Uuid, marked: u64 },

    /// Ticket status, assignment or stage changed
    TicketUpdated {
        ticket_id: Uuid,
        client_id: Uuid,
        status: TicketStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        assigned_to: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage_id: Option<Uuid>,
    },

    /// Personal notification for the connected user
    Notification { notification: NotificationEvent },

    /// Operator availability changed
    PresenceUpdate { user_id: Uuid, status: UserStatus },

    /// Everyone currently online (sent on initial connection)
    PresenceBatch { users: Vec<UserPresence> },

    /// Heartbeat response
    Pong,

    /// Error message
    Error { message: String },

    /// Connection acknowledged
    Connected { session_id: Uuid },
}

// =============================================================================
// Event Data Structures
// =============================================================================

#[derive(Debug, Serialize, Clone)]
pub struct ChatMessageEvent {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<Uuid>,
    pub channel: Channel,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    pub is_ai_generated: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Clone)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Clone)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub full_name: String,
    pub status: UserStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_deserialization() {
        let json = r#"{"type":"subscribe","client_id":"550e8400-e29b-41d4-a716-446655440000"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Subscribe { client_id } => {
                assert_eq!(client_id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
            }
            _ => panic!("Expected Subscribe event"),
        }

        let event: ClientEvent = serde_json::from_str(r#"{"type":"set_status","status":"busy"}"#).unwrap();
        assert!(matches!(event, ClientEvent::SetStatus { status: UserStatus::Busy }));
    }

    #[test]
    fn test_server_event_serialization() {
        let json = serde_json::to_string(&ServerEvent::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let user_id = Uuid::nil();
        let json = serde_json::to_value(ServerEvent::PresenceUpdate {
            user_id,
            status: UserStatus::Online,
        })
        .unwrap();
        assert_eq!(json["type"], "presence_update");
        assert_eq!(json["status"], "online");
    }

    #[test]
    fn test_ticket_updated_skips_empty_fields() {
        let json = serde_json::to_value(ServerEvent::TicketUpdated {
            ticket_id: Uuid::nil(),
            client_id: Uuid::nil(),
            status: TicketStatus::Resolved,
            assigned_to: None,
            stage_id: None,
        })
        .unwrap();
        assert_eq!(json["status"], "resolved");
        assert!(json.get("assigned_to").is_none());
    }
}
