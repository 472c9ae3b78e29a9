//! Ticket lifecycle: creation, status changes, transfers and funnel stages
//!
//! Status changes and transfers lock the ticket row (`SELECT ... FOR UPDATE`)
//! inside a transaction, so two operators acting at once cannot both win.

use linedesk_shared::{
    workflow::{
        check_transition, next_funnel_stage, pick_line_operator, transition_effect,
        OperatorCandidate, StageRule, TimestampChange,
    },
    Channel, NotificationKind, Priority, TicketStatus, UserStatus,
};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::notifications::{self, NewNotification, NotificationRow, NotificationTarget};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    websocket::{events::ServerEvent, WebSocketState},
};

pub const SUBJECT_MAX_CHARS: usize = 500;

/// Column list shared by every query that returns a ticket
pub const TICKET_COLUMNS: &str = r#"
    tickets.id, tickets.number, tickets.subject, tickets.description, tickets.client_id,
    (SELECT full_name FROM clients WHERE clients.id = tickets.client_id) AS client_name,
    tickets.created_by, tickets.assigned_to,
    (SELECT full_name FROM users WHERE users.id = tickets.assigned_to) AS assigned_to_name,
    tickets.line_id, tickets.status, tickets.priority, tickets.channel,
    tickets.funnel_id, tickets.stage_id,
    tickets.created_at, tickets.updated_at, tickets.resolved_at, tickets.closed_at
"#;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TicketRow {
    pub id: Uuid,
    pub number: i64,
    pub subject: String,
    pub description: Option<String>,
    pub client_id: Uuid,
    pub client_name: Option<String>,
    pub created_by: Uuid,
    pub assigned_to: Option<Uuid>,
    pub assigned_to_name: Option<String>,
    pub line_id: Option<Uuid>,
    pub status: TicketStatus,
    pub priority: Priority,
    pub channel: Option<Channel>,
    pub funnel_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
}

impl TicketRow {
    pub fn updated_event(&self) -> ServerEvent {
        ServerEvent::TicketUpdated {
            ticket_id: self.id,
            client_id: self.client_id,
            status: self.status,
            assigned_to: self.assigned_to,
            stage_id: self.stage_id,
        }
    }
}

pub async fn fetch_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> ApiResult<TicketRow> {
    sqlx::query_as::<_, TicketRow>(&format!(
        "SELECT {} FROM tickets WHERE tickets.id = $1",
        TICKET_COLUMNS
    ))
    .bind(ticket_id)
    .fetch_optional(conn)
    .await?
    .ok_or(ApiError::NotFound)
}

pub async fn get_ticket(pool: &PgPool, ticket_id: Uuid) -> ApiResult<TicketRow> {
    let mut conn = pool.acquire().await?;
    fetch_ticket(&mut conn, ticket_id).await
}

// =============================================================================
// Creation
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub subject: String,
    pub description: Option<String>,
    pub client_id: Uuid,
    pub priority: Option<Priority>,
    pub channel: Option<Channel>,
    pub assigned_to: Option<Uuid>,
    pub line_id: Option<Uuid>,
}

pub fn validate_subject(subject: &str) -> ApiResult<String> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(ApiError::Validation("Subject is required".into()));
    }
    if subject.chars().count() > SUBJECT_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Subject must be at most {} characters",
            SUBJECT_MAX_CHARS
        )));
    }
    Ok(subject.to_string())
}

/// Default funnel and its first stage, if a default funnel exists
async fn default_funnel_entry(
    conn: &mut PgConnection,
) -> Result<Option<(Uuid, Option<Uuid>)>, sqlx::Error> {
    sqlx::query_as::<_, (Uuid, Option<Uuid>)>(
        r#"
        SELECT f.id,
               (SELECT s.id FROM funnel_stages s
                WHERE s.funnel_id = f.id
                ORDER BY s.position, s.created_at
                LIMIT 1)
        FROM funnels f
        WHERE f.is_default
        "#,
    )
    .fetch_optional(conn)
    .await
}

async fn ensure_active_user(conn: &mut PgConnection, user_id: Uuid) -> ApiResult<Option<Uuid>> {
    let row: Option<(bool, Option<Uuid>)> =
        sqlx::query_as("SELECT is_active, line_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(conn)
            .await?;

    match row {
        Some((true, line_id)) => Ok(line_id),
        Some((false, _)) => Err(ApiError::Validation("Assignee is deactivated".into())),
        None => Err(ApiError::Validation("Assignee does not exist".into())),
    }
}

async fn ensure_active_line(conn: &mut PgConnection, line_id: Uuid) -> ApiResult<()> {
    let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM lines WHERE id = $1")
        .bind(line_id)
        .fetch_optional(conn)
        .await?;

    match active {
        Some(true) => Ok(()),
        Some(false) => Err(ApiError::Validation("Line is inactive".into())),
        None => Err(ApiError::Validation("Line does not exist".into())),
    }
}

/// Members of a line in no particular order
async fn line_candidates(
    conn: &mut PgConnection,
    line_id: Uuid,
) -> Result<Vec<OperatorCandidate>, sqlx::Error> {
    #[derive(FromRow)]
    struct CandidateRow {
        id: Uuid,
        line_position: i32,
        created_at: OffsetDateTime,
        is_active: bool,
        status: UserStatus,
    }

    let rows = sqlx::query_as::<_, CandidateRow>(
        "SELECT id, line_position, created_at, is_active, status FROM users WHERE line_id = $1",
    )
    .bind(line_id)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| OperatorCandidate {
            user_id: r.id,
            line_position: r.line_position,
            created_at: r.created_at,
            is_active: r.is_active,
            status: r.status,
        })
        .collect())
}

pub async fn create_ticket(
    pool: &PgPool,
    ws: &WebSocketState,
    actor: &AuthUser,
    new: NewTicket,
) -> ApiResult<TicketRow> {
    let subject = validate_subject(&new.subject)?;
    let mut tx = pool.begin().await?;

    let client_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(new.client_id)
    .fetch_one(&mut *tx)
    .await?;
    if !client_exists {
        return Err(ApiError::Validation("Client does not exist".into()));
    }

    let mut line_id = new.line_id;
    let assigned_to = match (new.assigned_to, new.line_id) {
        (Some(user_id), _) => {
            let user_line = ensure_active_user(&mut tx, user_id).await?;
            line_id = line_id.or(user_line);
            Some(user_id)
        }
        (None, Some(line)) => {
            ensure_active_line(&mut tx, line).await?;
            pick_line_operator(&line_candidates(&mut tx, line).await?)
        }
        (None, None) => None,
    };

    let (funnel_id, stage_id) = match default_funnel_entry(&mut tx).await? {
        Some((funnel, stage)) => (Some(funnel), stage),
        None => (None, None),
    };

    let ticket_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO tickets (subject, description, client_id, created_by, assigned_to, line_id,
                             priority, channel, funnel_id, stage_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(&subject)
    .bind(&new.description)
    .bind(new.client_id)
    .bind(actor.user_id)
    .bind(assigned_to)
    .bind(line_id)
    .bind(new.priority.unwrap_or_default())
    .bind(new.channel)
    .bind(funnel_id)
    .bind(stage_id)
    .fetch_one(&mut *tx)
    .await?;

    let ticket = fetch_ticket(&mut tx, ticket_id).await?;

    let notification = match assigned_to.filter(|id| *id != actor.user_id) {
        Some(assignee) => Some(
            notifications::store(
                &mut *tx,
                &NewNotification {
                    user_id: assignee,
                    kind: NotificationKind::TicketAssigned,
                    title: format!("Ticket #{} assigned to you", ticket.number),
                    body: ticket.subject.clone(),
                    target: Some(NotificationTarget::Ticket(ticket.id)),
                },
            )
            .await?,
        ),
        None => None,
    };

    tx.commit().await?;

    if let Some(row) = &notification {
        notifications::push(ws, row).await;
    }
    ws.broadcast_client(&ticket.client_id, ticket.updated_event()).await;

    tracing::info!(
        ticket_id = %ticket.id,
        number = ticket.number,
        client_id = %ticket.client_id,
        assigned_to = ?ticket.assigned_to,
        "Ticket created"
    );

    Ok(ticket)
}

// =============================================================================
// Status changes
// =============================================================================

fn timestamp_sql(change: TimestampChange, column: &str) -> String {
    match change {
        TimestampChange::Keep => column.to_string(),
        TimestampChange::Set => "NOW()".to_string(),
        TimestampChange::Clear => "NULL".to_string(),
    }
}

/// Operators may act on their own or unassigned tickets; supervisors on any
fn ensure_can_act(actor: &AuthUser, assigned_to: Option<Uuid>) -> ApiResult<()> {
    match assigned_to {
        Some(assignee) if assignee != actor.user_id => actor.require_supervisor(),
        _ => Ok(()),
    }
}

/// Only the current assignee or a supervisor may hand a ticket over
fn ensure_can_transfer(actor: &AuthUser, assigned_to: Option<Uuid>) -> ApiResult<()> {
    if assigned_to == Some(actor.user_id) {
        Ok(())
    } else {
        actor.require_supervisor()
    }
}

#[derive(FromRow)]
struct LockedTicket {
    status: TicketStatus,
    assigned_to: Option<Uuid>,
    line_id: Option<Uuid>,
    funnel_id: Option<Uuid>,
    stage_id: Option<Uuid>,
    number: i64,
    subject: String,
}

async fn lock_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> ApiResult<LockedTicket> {
    sqlx::query_as::<_, LockedTicket>(
        r#"
        SELECT status, assigned_to, line_id, funnel_id, stage_id, number, subject
        FROM tickets WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(ticket_id)
    .fetch_optional(conn)
    .await?
    .ok_or(ApiError::NotFound)
}

/// Stage the funnel auto-advances to after a status change
async fn auto_stage(
    conn: &mut PgConnection,
    funnel_id: Uuid,
    current_stage: Option<Uuid>,
    status: TicketStatus,
) -> Result<Option<Uuid>, sqlx::Error> {
    #[derive(FromRow)]
    struct StageRow {
        id: Uuid,
        position: i32,
        trigger_status: Option<TicketStatus>,
    }

    let stages = sqlx::query_as::<_, StageRow>(
        "SELECT id, position, trigger_status FROM funnel_stages WHERE funnel_id = $1",
    )
    .bind(funnel_id)
    .fetch_all(conn)
    .await?;

    let current_position = current_stage
        .and_then(|id| stages.iter().find(|s| s.id == id))
        .map(|s| s.position);
    let rules: Vec<StageRule> = stages
        .iter()
        .map(|s| StageRule {
            stage_id: s.id,
            position: s.position,
            trigger_status: s.trigger_status,
        })
        .collect();

    Ok(next_funnel_stage(&rules, current_position, status))
}

/// Move a ticket to `next`, applying lifecycle timestamps and funnel rules
pub async fn change_status(
    pool: &PgPool,
    ws: &WebSocketState,
    actor: &AuthUser,
    ticket_id: Uuid,
    next: TicketStatus,
) -> ApiResult<TicketRow> {
    let mut tx = pool.begin().await?;
    let locked = lock_ticket(&mut tx, ticket_id).await?;
    ensure_can_act(actor, locked.assigned_to)?;
    check_transition(locked.status, next)?;

    if locked.status == next {
        let ticket = fetch_ticket(&mut tx, ticket_id).await?;
        tx.commit().await?;
        return Ok(ticket);
    }

    let stage_id = match locked.funnel_id {
        Some(funnel_id) => auto_stage(&mut tx, funnel_id, locked.stage_id, next)
            .await?
            .or(locked.stage_id),
        None => locked.stage_id,
    };

    let effect = transition_effect(locked.status, next);
    let sql = format!(
        r#"
        UPDATE tickets
        SET status = $2, stage_id = $3,
            resolved_at = {}, closed_at = {}, updated_at = NOW()
        WHERE id = $1
        "#,
        timestamp_sql(effect.resolved_at, "resolved_at"),
        timestamp_sql(effect.closed_at, "closed_at"),
    );
    sqlx::query(&sql)
        .bind(ticket_id)
        .bind(next)
        .bind(stage_id)
        .execute(&mut *tx)
        .await?;

    let ticket = fetch_ticket(&mut tx, ticket_id).await?;
    tx.commit().await?;

    ws.broadcast_client(&ticket.client_id, ticket.updated_event()).await;

    tracing::info!(
        ticket_id = %ticket_id,
        from = %locked.status,
        to = %next,
        stage_id = ?ticket.stage_id,
        actor = %actor.user_id,
        "Ticket status changed"
    );

    Ok(ticket)
}

// =============================================================================
// Transfers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTarget {
    Line(Uuid),
    User(Uuid),
}

#[derive(Debug, Serialize)]
pub struct TransferOutcome {
    pub ticket: TicketRow,
    /// True when the line had nobody available and the ticket waits unassigned
    pub queued: bool,
}

pub async fn transfer(
    pool: &PgPool,
    ws: &WebSocketState,
    actor: &AuthUser,
    ticket_id: Uuid,
    target: TransferTarget,
    reason: Option<String>,
) -> ApiResult<TransferOutcome> {
    let mut tx = pool.begin().await?;
    let locked = lock_ticket(&mut tx, ticket_id).await?;
    ensure_can_transfer(actor, locked.assigned_to)?;

    let (assignee, line_id) = match target {
        TransferTarget::Line(line_id) => {
            ensure_active_line(&mut tx, line_id).await?;
            let candidates = line_candidates(&mut tx, line_id).await?;
            (pick_line_operator(&candidates), Some(line_id))
        }
        TransferTarget::User(user_id) => {
            let user_line = ensure_active_user(&mut tx, user_id).await?;
            (Some(user_id), user_line.or(locked.line_id))
        }
    };

    sqlx::query(
        "UPDATE tickets SET assigned_to = $2, line_id = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(assignee)
    .bind(line_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO transfer_history
            (ticket_id, from_user_id, to_user_id, from_line_id, to_line_id, transferred_by, reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(ticket_id)
    .bind(locked.assigned_to)
    .bind(assignee)
    .bind(locked.line_id)
    .bind(line_id)
    .bind(actor.user_id)
    .bind(reason.as_deref().map(str::trim).filter(|r| !r.is_empty()))
    .execute(&mut *tx)
    .await?;

    let notification: Option<NotificationRow> =
        match assignee.filter(|id| *id != actor.user_id) {
            Some(user_id) => Some(
                notifications::store(
                    &mut *tx,
                    &NewNotification {
                        user_id,
                        kind: NotificationKind::TicketTransferred,
                        title: format!("Ticket #{} transferred to you", locked.number),
                        body: reason.clone().unwrap_or_else(|| locked.subject.clone()),
                        target: Some(NotificationTarget::Ticket(ticket_id)),
                    },
                )
                .await?,
            ),
            None => None,
        };

    let ticket = fetch_ticket(&mut tx, ticket_id).await?;
    tx.commit().await?;

    if let Some(row) = &notification {
        notifications::push(ws, row).await;
    }
    ws.broadcast_client(&ticket.client_id, ticket.updated_event()).await;

    let queued = assignee.is_none();
    tracing::info!(
        ticket_id = %ticket_id,
        from_user = ?locked.assigned_to,
        to_user = ?assignee,
        line_id = ?line_id,
        queued,
        "Ticket transferred"
    );

    Ok(TransferOutcome { ticket, queued })
}

// =============================================================================
// Funnel stages
// =============================================================================

/// Place a ticket on a stage by hand. A ticket outside any funnel joins the
/// stage's funnel; otherwise the stage must belong to the ticket's funnel.
pub async fn move_to_stage(
    pool: &PgPool,
    ws: &WebSocketState,
    actor: &AuthUser,
    ticket_id: Uuid,
    stage_id: Uuid,
) -> ApiResult<TicketRow> {
    let mut tx = pool.begin().await?;
    let locked = lock_ticket(&mut tx, ticket_id).await?;
    ensure_can_act(actor, locked.assigned_to)?;

    let stage_funnel: Uuid = sqlx::query_scalar("SELECT funnel_id FROM funnel_stages WHERE id = $1")
        .bind(stage_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::Validation("Stage does not exist".into()))?;

    if locked.funnel_id.is_some_and(|f| f != stage_funnel) {
        return Err(ApiError::Validation(
            "Stage does not belong to the ticket's funnel".into(),
        ));
    }

    sqlx::query(
        "UPDATE tickets SET funnel_id = $2, stage_id = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(ticket_id)
    .bind(stage_funnel)
    .bind(stage_id)
    .execute(&mut *tx)
    .await?;

    let ticket = fetch_ticket(&mut tx, ticket_id).await?;
    tx.commit().await?;

    ws.broadcast_client(&ticket.client_id, ticket.updated_event()).await;
    Ok(ticket)
}

// =============================================================================
// Details and deletion
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct TicketChanges {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

/// Edit subject, description or priority. Status, assignment and stage go
/// through their own operations.
pub async fn update_details(
    pool: &PgPool,
    ws: &WebSocketState,
    actor: &AuthUser,
    ticket_id: Uuid,
    changes: TicketChanges,
) -> ApiResult<TicketRow> {
    let subject = changes.subject.as_deref().map(validate_subject).transpose()?;

    let mut tx = pool.begin().await?;
    let locked = lock_ticket(&mut tx, ticket_id).await?;
    ensure_can_act(actor, locked.assigned_to)?;

    sqlx::query(
        r#"
        UPDATE tickets
        SET subject = COALESCE($2, subject),
            description = COALESCE($3, description),
            priority = COALESCE($4, priority),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(ticket_id)
    .bind(subject)
    .bind(changes.description)
    .bind(changes.priority)
    .execute(&mut *tx)
    .await?;

    let ticket = fetch_ticket(&mut tx, ticket_id).await?;
    tx.commit().await?;

    ws.broadcast_client(&ticket.client_id, ticket.updated_event()).await;
    Ok(ticket)
}

/// Hard delete; comments and transfer history cascade
pub async fn delete_ticket(pool: &PgPool, actor: &AuthUser, ticket_id: Uuid) -> ApiResult<()> {
    actor.require_supervisor()?;

    let deleted = sqlx::query("DELETE FROM tickets WHERE id = $1")
        .bind(ticket_id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    tracing::info!(ticket_id = %ticket_id, actor = %actor.user_id, "Ticket deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use linedesk_shared::RoleLevel;

    fn actor(role: RoleLevel) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "op@example.com".into(),
            full_name: "Operator".into(),
            role,
            role_name: "operator".into(),
            line_id: None,
        }
    }

    #[test]
    fn test_subject_validation() {
        assert!(validate_subject("   ").is_err());
        assert_eq!(validate_subject("  Не работает доставка ").unwrap(), "Не работает доставка");
        assert!(validate_subject(&"я".repeat(500)).is_ok());
        assert!(matches!(
            validate_subject(&"я".repeat(501)),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn test_timestamp_sql() {
        assert_eq!(timestamp_sql(TimestampChange::Keep, "closed_at"), "closed_at");
        assert_eq!(timestamp_sql(TimestampChange::Set, "closed_at"), "NOW()");
        assert_eq!(timestamp_sql(TimestampChange::Clear, "closed_at"), "NULL");
    }

    #[test]
    fn test_only_assignee_or_supervisor_may_act() {
        let operator = actor(RoleLevel::Operator);
        let supervisor = actor(RoleLevel::Supervisor);
        let someone_else = Some(Uuid::new_v4());

        assert!(ensure_can_act(&operator, None).is_ok());
        assert!(ensure_can_act(&operator, Some(operator.user_id)).is_ok());
        assert!(matches!(
            ensure_can_act(&operator, someone_else),
            Err(ApiError::Forbidden)
        ));
        assert!(ensure_can_act(&supervisor, someone_else).is_ok());
    }

    #[test]
    fn test_unassigned_ticket_transfer_needs_supervisor() {
        let operator = actor(RoleLevel::Operator);
        let supervisor = actor(RoleLevel::Supervisor);

        assert!(matches!(
            ensure_can_transfer(&operator, None),
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            ensure_can_transfer(&operator, Some(Uuid::new_v4())),
            Err(ApiError::Forbidden)
        ));
        assert!(ensure_can_transfer(&operator, Some(operator.user_id)).is_ok());
        assert!(ensure_can_transfer(&supervisor, None).is_ok());
    }
}
