//! Registry of live websocket sessions

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;
use super::room::RoomManager;

type Sessions = HashMap<Uuid, Arc<Connection>>;

/// Sessions grouped by operator, plus the client chat rooms
#[derive(Clone, Default)]
pub struct WebSocketState {
    /// user_id -> session_id -> connection
    operators: Arc<RwLock<HashMap<Uuid, Sessions>>>,
    pub rooms: Arc<RoomManager>,
}

impl WebSocketState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut operators = self.operators.write().await;
        let sessions = operators.entry(conn.user_id).or_default();
        sessions.insert(conn.session_id, Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            user_id = %conn.user_id,
            user_sessions = sessions.len(),
            "WebSocket session opened"
        );
        conn
    }

    /// Drop a session and its room memberships. Returns true when it was the
    /// operator's last open session.
    pub async fn remove_connection(&self, conn: &Connection) -> bool {
        self.rooms.leave_all(conn).await;

        let mut operators = self.operators.write().await;
        let Some(sessions) = operators.get_mut(&conn.user_id) else {
            return true;
        };
        sessions.remove(&conn.session_id);
        let last = sessions.is_empty();
        if last {
            operators.remove(&conn.user_id);
        }

        tracing::info!(
            session_id = %conn.session_id,
            user_id = %conn.user_id,
            last_session = last,
            "WebSocket session closed"
        );
        last
    }

    pub async fn is_user_connected(&self, user_id: &Uuid) -> bool {
        self.operators.read().await.contains_key(user_id)
    }

    /// Push an event to every open session of one operator
    pub async fn send_to_user(&self, user_id: &Uuid, event: ServerEvent) {
        let operators = self.operators.read().await;
        if let Some(sessions) = operators.get(user_id) {
            for conn in sessions.values() {
                let _ = conn.send(event.clone());
            }
        }
    }

    pub async fn broadcast_all(&self, event: ServerEvent) {
        let operators = self.operators.read().await;
        for conn in operators.values().flat_map(HashMap::values) {
            let _ = conn.send(event.clone());
        }
    }

    /// Push an event to a client's chat room
    pub async fn broadcast_client(&self, client_id: &Uuid, event: ServerEvent) {
        self.rooms.broadcast(client_id, event).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.operators.read().await.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_last_session_reported_on_close() {
        let state = WebSocketState::new();
        let user_id = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let first = state.add_connection(Connection::new(user_id, tx1)).await;
        let second = state.add_connection(Connection::new(user_id, tx2)).await;
        assert_eq!(state.connection_count().await, 2);

        assert!(!state.remove_connection(&first).await);
        assert!(state.is_user_connected(&user_id).await);

        assert!(state.remove_connection(&second).await);
        assert!(!state.is_user_connected(&user_id).await);
        assert_eq!(state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_all_their_sessions() {
        let state = WebSocketState::new();
        let user_id = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        state.add_connection(Connection::new(user_id, tx1)).await;
        state.add_connection(Connection::new(user_id, tx2)).await;
        state.add_connection(Connection::new(Uuid::new_v4(), tx3)).await;

        state.send_to_user(&user_id, ServerEvent::Pong).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closing_session_leaves_rooms() {
        let state = WebSocketState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = state.add_connection(Connection::new(Uuid::new_v4(), tx)).await;
        let client_id = Uuid::new_v4();

        state.rooms.join(client_id, &conn).await;
        assert_eq!(state.rooms.room_size(&client_id).await, 1);

        state.remove_connection(&conn).await;
        assert_eq!(state.rooms.room_size(&client_id).await, 0);
    }
}
