//! Ticket routes

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{Channel, PageParams, PaginatedResponse, Priority, TicketStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{check_rate_limit, MessageResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::tickets::{
        self, NewTicket, TicketChanges, TicketRow, TransferOutcome, TransferTarget, TICKET_COLUMNS,
    },
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub priority: Option<Priority>,
    pub channel: Option<Channel>,
    pub assigned_to: Option<Uuid>,
    pub line_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub funnel_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    /// Only tickets assigned to the caller
    pub mine: Option<bool>,
    /// Only unassigned tickets (line queues)
    pub unassigned: Option<bool>,
    /// Subject search
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub description: Option<String>,
    pub client_id: Uuid,
    pub priority: Option<Priority>,
    pub channel: Option<Channel>,
    pub assigned_to: Option<Uuid>,
    pub line_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: TicketStatus,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub line_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl TransferRequest {
    fn target(&self) -> ApiResult<TransferTarget> {
        match (self.line_id, self.user_id) {
            (Some(line_id), None) => Ok(TransferTarget::Line(line_id)),
            (None, Some(user_id)) => Ok(TransferTarget::User(user_id)),
            _ => Err(ApiError::Validation(
                "Specify exactly one of line_id or user_id".into(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MoveToStageRequest {
    pub stage_id: Uuid,
}

#[derive(Debug, Serialize, FromRow)]
pub struct TransferRecord {
    pub id: Uuid,
    pub from_user_id: Option<Uuid>,
    pub from_user_name: Option<String>,
    pub to_user_id: Option<Uuid>,
    pub to_user_name: Option<String>,
    pub from_line_id: Option<Uuid>,
    pub to_line_id: Option<Uuid>,
    pub to_line_name: Option<String>,
    pub transferred_by: Uuid,
    pub transferred_by_name: Option<String>,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Handlers
// =============================================================================

/// List tickets, urgent first, newest first within a priority
pub async fn list_tickets(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(filter): Query<TicketFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<TicketRow>>> {
    let assigned_to = if filter.mine.unwrap_or(false) {
        Some(auth_user.user_id)
    } else {
        filter.assigned_to
    };
    let pattern = filter
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")));

    const WHERE: &str = r#"
        WHERE ($1::varchar IS NULL OR tickets.status = $1)
          AND ($2::varchar IS NULL OR tickets.priority = $2)
          AND ($3::varchar IS NULL OR tickets.channel = $3)
          AND ($4::uuid IS NULL OR tickets.assigned_to = $4)
          AND ($5::uuid IS NULL OR tickets.line_id = $5)
          AND ($6::uuid IS NULL OR tickets.client_id = $6)
          AND ($7::uuid IS NULL OR tickets.funnel_id = $7)
          AND ($8::uuid IS NULL OR tickets.stage_id = $8)
          AND (NOT $9 OR tickets.assigned_to IS NULL)
          AND ($10::text IS NULL OR tickets.subject ILIKE $10)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tickets {}", WHERE))
        .bind(filter.status)
        .bind(filter.priority)
        .bind(filter.channel)
        .bind(assigned_to)
        .bind(filter.line_id)
        .bind(filter.client_id)
        .bind(filter.funnel_id)
        .bind(filter.stage_id)
        .bind(filter.unassigned.unwrap_or(false))
        .bind(&pattern)
        .fetch_one(&state.pool)
        .await?;

    let tickets = sqlx::query_as::<_, TicketRow>(&format!(
        r#"
        SELECT {} FROM tickets
        {}
        ORDER BY CASE tickets.priority
                     WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3
                 END,
                 tickets.created_at DESC
        LIMIT $11 OFFSET $12
        "#,
        TICKET_COLUMNS, WHERE
    ))
    .bind(filter.status)
    .bind(filter.priority)
    .bind(filter.channel)
    .bind(assigned_to)
    .bind(filter.line_id)
    .bind(filter.client_id)
    .bind(filter.funnel_id)
    .bind(filter.stage_id)
    .bind(filter.unassigned.unwrap_or(false))
    .bind(&pattern)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(tickets, total, &page)))
}

pub async fn create_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateTicketRequest>,
) -> ApiResult<Json<TicketRow>> {
    check_rate_limit(
        state
            .rate_limiter
            .check_ticket_creation(auth_user.user_id)
            .await,
        "ticket creation",
    )?;

    let ticket = tickets::create_ticket(
        &state.pool,
        &state.ws_state,
        &auth_user,
        NewTicket {
            subject: req.subject,
            description: req.description,
            client_id: req.client_id,
            priority: req.priority,
            channel: req.channel,
            assigned_to: req.assigned_to,
            line_id: req.line_id,
        },
    )
    .await?;

    Ok(Json(ticket))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<TicketRow>> {
    Ok(Json(tickets::get_ticket(&state.pool, ticket_id).await?))
}

pub async fn update_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> ApiResult<Json<TicketRow>> {
    let ticket = tickets::update_details(
        &state.pool,
        &state.ws_state,
        &auth_user,
        ticket_id,
        TicketChanges {
            subject: req.subject,
            description: req.description,
            priority: req.priority,
        },
    )
    .await?;
    Ok(Json(ticket))
}

pub async fn delete_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    tickets::delete_ticket(&state.pool, &auth_user, ticket_id).await?;
    Ok(Json(MessageResponse::new("Ticket deleted")))
}

pub async fn change_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<ChangeStatusRequest>,
) -> ApiResult<Json<TicketRow>> {
    let ticket =
        tickets::change_status(&state.pool, &state.ws_state, &auth_user, ticket_id, req.status)
            .await?;
    Ok(Json(ticket))
}

pub async fn transfer_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<TransferOutcome>> {
    let target = req.target()?;
    let reason = req
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    let outcome = tickets::transfer(
        &state.pool,
        &state.ws_state,
        &auth_user,
        ticket_id,
        target,
        reason,
    )
    .await?;
    Ok(Json(outcome))
}

/// Transfer journal, oldest first
pub async fn list_transfers(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<Vec<TransferRecord>>> {
    tickets::get_ticket(&state.pool, ticket_id).await?;

    let records = sqlx::query_as::<_, TransferRecord>(
        r#"
        SELECT th.id,
               th.from_user_id, fu.full_name AS from_user_name,
               th.to_user_id, tu.full_name AS to_user_name,
               th.from_line_id, th.to_line_id, tl.name AS to_line_name,
               th.transferred_by, bu.full_name AS transferred_by_name,
               th.reason, th.created_at
        FROM transfer_history th
        LEFT JOIN users fu ON fu.id = th.from_user_id
        LEFT JOIN users tu ON tu.id = th.to_user_id
        LEFT JOIN users bu ON bu.id = th.transferred_by
        LEFT JOIN lines tl ON tl.id = th.to_line_id
        WHERE th.ticket_id = $1
        ORDER BY th.created_at
        "#,
    )
    .bind(ticket_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(records))
}

pub async fn move_to_stage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<MoveToStageRequest>,
) -> ApiResult<Json<TicketRow>> {
    let ticket =
        tickets::move_to_stage(&state.pool, &state.ws_state, &auth_user, ticket_id, req.stage_id)
            .await?;
    Ok(Json(ticket))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(json: &str) -> TransferRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_transfer_target_requires_exactly_one() {
        let line = Uuid::new_v4();
        assert_eq!(
            transfer(&format!(r#"{{"line_id": "{}"}}"#, line)).target().unwrap(),
            TransferTarget::Line(line)
        );

        let user = Uuid::new_v4();
        assert_eq!(
            transfer(&format!(r#"{{"user_id": "{}", "reason": "VIP"}}"#, user))
                .target()
                .unwrap(),
            TransferTarget::User(user)
        );

        assert!(transfer("{}").target().is_err());
        assert!(transfer(&format!(
            r#"{{"line_id": "{}", "user_id": "{}"}}"#,
            line, user
        ))
        .target()
        .is_err());
    }

    #[test]
    fn test_status_request_rejects_unknown_status() {
        assert!(serde_json::from_str::<ChangeStatusRequest>(r#"{"status": "archived"}"#).is_err());
        let req: ChangeStatusRequest = serde_json::from_str(r#"{"status": "resolved"}"#).unwrap();
        assert_eq!(req.status, TicketStatus::Resolved);
    }
}
