//! Call journal

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{CallDirection, CallStatus, PageParams, PaginatedResponse};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::calls::{CallRow, CALL_COLUMNS},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct CallFilter {
    pub direction: Option<CallDirection>,
    pub status: Option<CallStatus>,
    pub operator_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct CallLogEntry {
    pub id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct CallDetail {
    #[serde(flatten)]
    pub call: CallRow,
    pub logs: Vec<CallLogEntry>,
}

pub async fn list_calls(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Query(filter): Query<CallFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<CallRow>>> {
    const WHERE: &str = r#"
        WHERE ($1::varchar IS NULL OR calls.direction = $1)
          AND ($2::varchar IS NULL OR calls.status = $2)
          AND ($3::uuid IS NULL OR calls.operator_id = $3)
          AND ($4::uuid IS NULL OR calls.client_id = $4)
          AND ($5::timestamptz IS NULL OR calls.started_at >= $5)
          AND ($6::timestamptz IS NULL OR calls.started_at < $6)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM calls {}", WHERE))
        .bind(filter.direction)
        .bind(filter.status)
        .bind(filter.operator_id)
        .bind(filter.client_id)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&state.pool)
        .await?;

    let calls = sqlx::query_as::<_, CallRow>(&format!(
        "SELECT {} FROM calls {} ORDER BY calls.started_at DESC LIMIT $7 OFFSET $8",
        CALL_COLUMNS, WHERE
    ))
    .bind(filter.direction)
    .bind(filter.status)
    .bind(filter.operator_id)
    .bind(filter.client_id)
    .bind(filter.from)
    .bind(filter.to)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(calls, total, &page)))
}

/// A call with its raw PBX event log
pub async fn get_call(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(call_id): Path<Uuid>,
) -> ApiResult<Json<CallDetail>> {
    let call = sqlx::query_as::<_, CallRow>(&format!(
        "SELECT {} FROM calls WHERE calls.id = $1",
        CALL_COLUMNS
    ))
    .bind(call_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)?;

    let logs = sqlx::query_as::<_, CallLogEntry>(
        "SELECT id, event, payload, created_at FROM call_logs WHERE call_id = $1 ORDER BY created_at",
    )
    .bind(call_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(CallDetail { call, logs }))
}
