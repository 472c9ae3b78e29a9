//! Client chat rooms
//!
//! Operators viewing a client's chat join that client's room and receive its
//! new messages and ticket updates.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

type Members = HashMap<Uuid, Arc<Connection>>;

#[derive(Default)]
pub struct RoomManager {
    /// client_id -> session_id -> connection
    rooms: RwLock<HashMap<Uuid, Members>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, client_id: Uuid, conn: &Arc<Connection>) {
        if !conn.follow(client_id).await {
            return;
        }
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(client_id).or_default();
        members.insert(conn.session_id, Arc::clone(conn));

        tracing::debug!(
            client_id = %client_id,
            session_id = %conn.session_id,
            room_size = members.len(),
            "Joined client room"
        );
    }

    pub async fn leave(&self, client_id: &Uuid, conn: &Connection) {
        if !conn.unfollow(client_id).await {
            return;
        }
        let mut rooms = self.rooms.write().await;
        Self::drop_member(&mut rooms, client_id, &conn.session_id);
    }

    /// Leave every room the session joined
    pub async fn leave_all(&self, conn: &Connection) {
        let followed = conn.take_followed().await;
        if followed.is_empty() {
            return;
        }
        let mut rooms = self.rooms.write().await;
        for client_id in &followed {
            Self::drop_member(&mut rooms, client_id, &conn.session_id);
        }
    }

    fn drop_member(rooms: &mut HashMap<Uuid, Members>, client_id: &Uuid, session_id: &Uuid) {
        if let Some(members) = rooms.get_mut(client_id) {
            members.remove(session_id);
            if members.is_empty() {
                rooms.remove(client_id);
            }
        }
    }

    /// Push an event to everyone following a client. Closed sessions are
    /// skipped; they leave their rooms on disconnect.
    pub async fn broadcast(&self, client_id: &Uuid, event: ServerEvent) {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(client_id) else {
            return;
        };

        let delivered = members
            .values()
            .filter(|conn| conn.send(event.clone()).is_ok())
            .count();

        tracing::debug!(client_id = %client_id, delivered, "Client room event");
    }

    pub async fn room_size(&self, client_id: &Uuid) -> usize {
        self.rooms.read().await.get(client_id).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
