//! Call journal fed by OnlinePBX webhook events

use linedesk_shared::{CallDirection, CallStatus};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::ApiResult,
    pbx::{apply_event, PbxEvent},
};

pub const CALL_COLUMNS: &str = r#"
    calls.id, calls.external_id, calls.client_id,
    (SELECT full_name FROM clients WHERE clients.id = calls.client_id) AS client_name,
    calls.operator_id,
    (SELECT full_name FROM users WHERE users.id = calls.operator_id) AS operator_name,
    calls.ticket_id, calls.direction, calls.caller_number, calls.callee_number, calls.status,
    calls.started_at, calls.answered_at, calls.ended_at,
    calls.duration_seconds, calls.talk_seconds, calls.record_url
"#;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CallRow {
    pub id: Uuid,
    pub external_id: String,
    pub client_id: Option<Uuid>,
    pub client_name: Option<String>,
    pub operator_id: Option<Uuid>,
    pub operator_name: Option<String>,
    pub ticket_id: Option<Uuid>,
    pub direction: CallDirection,
    pub caller_number: String,
    pub callee_number: String,
    pub status: CallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<i32>,
    pub talk_seconds: Option<i32>,
    pub record_url: Option<String>,
}

#[derive(FromRow)]
struct StoredCall {
    id: Uuid,
    status: CallStatus,
    answered_at: Option<OffsetDateTime>,
}

/// Record a PBX event: create or update the call and append to its log.
///
/// Events for unknown call ids create the call, so a lost `call_start` does
/// not lose the call.
pub async fn record_event(
    pool: &PgPool,
    event: &PbxEvent,
    payload: serde_json::Value,
) -> ApiResult<CallRow> {
    let mut tx = pool.begin().await?;

    let stored = sqlx::query_as::<_, StoredCall>(
        "SELECT id, status, answered_at FROM calls WHERE external_id = $1 FOR UPDATE",
    )
    .bind(&event.uuid)
    .fetch_optional(&mut *tx)
    .await?;

    let call_id = match &stored {
        Some(call) => call.id,
        None => {
            let client_number = event.client_number();
            let client_id: Option<Uuid> = if client_number.is_empty() {
                None
            } else {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM clients
                    WHERE deleted_at IS NULL AND (phone = $1 OR whatsapp_phone = $1)
                    ORDER BY created_at
                    LIMIT 1
                    "#,
                )
                .bind(&client_number)
                .fetch_optional(&mut *tx)
                .await?
            };

            let operator_id: Option<Uuid> = match event.operator_extension() {
                Some(ext) => sqlx::query_scalar(
                    "SELECT id FROM users WHERE sip_extension = $1 AND is_active",
                )
                .bind(ext)
                .fetch_optional(&mut *tx)
                .await?,
                None => None,
            };

            let ticket_id: Option<Uuid> = match client_id {
                Some(client_id) => sqlx::query_scalar(
                    r#"
                    SELECT id FROM tickets
                    WHERE client_id = $1 AND status IN ('new', 'open', 'pending')
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(client_id)
                .fetch_optional(&mut *tx)
                .await?,
                None => None,
            };

            sqlx::query_scalar(
                r#"
                INSERT INTO calls (external_id, client_id, operator_id, ticket_id, direction,
                                   caller_number, callee_number, status, started_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'ringing', $8)
                RETURNING id
                "#,
            )
            .bind(&event.uuid)
            .bind(client_id)
            .bind(operator_id)
            .bind(ticket_id)
            .bind(event.direction)
            .bind(&event.caller)
            .bind(&event.callee)
            .bind(event.occurred_at())
            .fetch_one(&mut *tx)
            .await?
        }
    };

    let (current, was_answered) = match &stored {
        Some(call) => (Some(call.status), call.answered_at.is_some()),
        None => (None, false),
    };

    match apply_event(event, current, was_answered) {
        Some(update) => {
            sqlx::query(
                r#"
                UPDATE calls
                SET status = $2,
                    answered_at = COALESCE($3, answered_at),
                    ended_at = COALESCE($4, ended_at),
                    duration_seconds = COALESCE($5, duration_seconds),
                    talk_seconds = COALESCE($6, talk_seconds),
                    record_url = COALESCE($7, record_url),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(call_id)
            .bind(update.status)
            .bind(update.answered_at)
            .bind(update.ended_at)
            .bind(update.duration_seconds)
            .bind(update.talk_seconds)
            .bind(update.record_url)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            tracing::debug!(call_uuid = %event.uuid, event = event.event.as_str(), "Call already final, state kept");
        }
    }

    sqlx::query("INSERT INTO call_logs (call_id, event, payload) VALUES ($1, $2, $3)")
        .bind(call_id)
        .bind(event.event.as_str())
        .bind(payload)
        .execute(&mut *tx)
        .await?;

    let call = sqlx::query_as::<_, CallRow>(&format!(
        "SELECT {} FROM calls WHERE calls.id = $1",
        CALL_COLUMNS
    ))
    .bind(call_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        call_id = %call.id,
        call_uuid = %event.uuid,
        event = event.event.as_str(),
        status = ?call.status,
        client_id = ?call.client_id,
        operator_id = ?call.operator_id,
        "PBX event recorded"
    );

    Ok(call)
}
