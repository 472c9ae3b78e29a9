//! One live websocket session of an operator

use std::collections::HashSet;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::ServerEvent;

#[derive(Debug)]
pub struct Connection {
    pub session_id: Uuid,
    pub user_id: Uuid,
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// Client chats this session follows; mirrors its room memberships
    followed: RwLock<HashSet<Uuid>>,
}

impl Connection {
    pub fn new(user_id: Uuid, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            sender,
            followed: RwLock::new(HashSet::new()),
        }
    }

    /// Queue an event for the socket writer. Fails once the writer is gone.
    #[allow(clippy::result_large_err)]
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    /// Returns false when the client was already followed
    pub(super) async fn follow(&self, client_id: Uuid) -> bool {
        self.followed.write().await.insert(client_id)
    }

    pub(super) async fn unfollow(&self, client_id: &Uuid) -> bool {
        self.followed.write().await.remove(client_id)
    }

    pub(super) async fn take_followed(&self) -> Vec<Uuid> {
        self.followed.write().await.drain().collect()
    }

    pub async fn follows(&self, client_id: &Uuid) -> bool {
        self.followed.read().await.contains(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Uuid::new_v4(), tx);
        let client_id = Uuid::new_v4();

        assert!(conn.follow(client_id).await);
        assert!(!conn.follow(client_id).await);
        assert!(conn.follows(&client_id).await);

        assert_eq!(conn.take_followed().await, vec![client_id]);
        assert!(!conn.follows(&client_id).await);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Uuid::new_v4(), tx);
        drop(rx);
        assert!(conn.send(ServerEvent::Pong).is_err());
    }
}
