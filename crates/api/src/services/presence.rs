//! Operator availability
//!
//! `users.status` drives line assignment, so every change goes through here
//! and is broadcast to all connected operators.

use linedesk_shared::UserStatus;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::websocket::{
    events::{ServerEvent, UserPresence},
    WebSocketState,
};

pub async fn set_status(
    pool: &PgPool,
    ws: &WebSocketState,
    user_id: Uuid,
    status: UserStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .bind(status)
        .execute(pool)
        .await?;

    ws.broadcast_all(ServerEvent::PresenceUpdate { user_id, status })
        .await;

    tracing::debug!(user_id = %user_id, status = ?status, "Operator status changed");
    Ok(())
}

/// Status an operator gets on opening a session. Only `offline` changes;
/// an operator who chose `busy` stays busy across tabs and reconnects.
pub fn status_on_connect(current: UserStatus) -> Option<UserStatus> {
    match current {
        UserStatus::Offline => Some(UserStatus::Online),
        UserStatus::Online | UserStatus::Busy => None,
    }
}

/// Bring an offline operator online when a session opens.
/// Returns the status the operator ends up with.
pub async fn mark_connected(
    pool: &PgPool,
    ws: &WebSocketState,
    user_id: Uuid,
) -> Result<UserStatus, sqlx::Error> {
    let current: UserStatus = sqlx::query_scalar("SELECT status FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;

    let Some(next) = status_on_connect(current) else {
        return Ok(current);
    };

    // Conditional so a concurrent `busy` set is never overwritten
    let updated = sqlx::query(
        "UPDATE users SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
    )
    .bind(user_id)
    .bind(next)
    .bind(current)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return sqlx::query_scalar("SELECT status FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await;
    }

    ws.broadcast_all(ServerEvent::PresenceUpdate {
        user_id,
        status: next,
    })
    .await;
    tracing::debug!(user_id = %user_id, status = ?next, "Operator came online");
    Ok(next)
}

/// Operators that are not offline
pub async fn online_users(pool: &PgPool) -> Result<Vec<UserPresence>, sqlx::Error> {
    #[derive(FromRow)]
    struct PresenceRow {
        id: Uuid,
        full_name: String,
        status: UserStatus,
    }

    let rows = sqlx::query_as::<_, PresenceRow>(
        r#"
        SELECT id, full_name, status
        FROM users
        WHERE is_active AND status <> 'offline'
        ORDER BY full_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| UserPresence {
            user_id: r.id,
            full_name: r.full_name,
            status: r.status,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_only_lifts_offline() {
        assert_eq!(status_on_connect(UserStatus::Offline), Some(UserStatus::Online));
        assert_eq!(status_on_connect(UserStatus::Busy), None);
        assert_eq!(status_on_connect(UserStatus::Online), None);
    }
}
