//! Task routes

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{NotificationKind, PageParams, PaginatedResponse, Priority, TaskStatus};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{double_option, MessageResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::notifications::{self, NewNotification, NotificationTarget},
    state::AppState,
};

const TITLE_MAX_CHARS: usize = 500;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub mine: Option<bool>,
    /// Unfinished tasks past their due date
    pub overdue: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_at: Option<OffsetDateTime>,
    pub client_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default, with = "double_option_rfc3339")]
    pub due_at: Option<Option<OffsetDateTime>>,
    #[serde(default, with = "double_option")]
    pub assigned_to: Option<Option<Uuid>>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeTaskStatusRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_at: Option<OffsetDateTime>,
    pub client_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub assigned_to_name: Option<String>,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// `due_at: null` clears the deadline, an absent field keeps it
mod double_option_rfc3339 {
    use serde::{Deserialize, Deserializer};
    use time::OffsetDateTime;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<OffsetDateTime>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "time::serde::rfc3339::option")] Option<OffsetDateTime>);

        Wrapper::deserialize(deserializer).map(|Wrapper(value)| Some(value))
    }
}

const TASK_COLUMNS: &str = r#"
    tasks.id, tasks.title, tasks.description, tasks.status, tasks.priority, tasks.due_at,
    tasks.client_id, tasks.ticket_id, tasks.assigned_to,
    (SELECT full_name FROM users WHERE users.id = tasks.assigned_to) AS assigned_to_name,
    tasks.created_by, tasks.completed_at, tasks.created_at, tasks.updated_at
"#;

fn validate_title(title: &str) -> ApiResult<String> {
    let title = title.trim();
    if title.is_empty() || title.chars().count() > TITLE_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Title must be 1-{} characters",
            TITLE_MAX_CHARS
        )));
    }
    Ok(title.to_string())
}

/// Creator, assignee or a supervisor
fn ensure_can_edit(actor: &AuthUser, task: &TaskRow) -> ApiResult<()> {
    if task.created_by == actor.user_id || task.assigned_to == Some(actor.user_id) {
        Ok(())
    } else {
        actor.require_supervisor()
    }
}

async fn fetch_task(conn: &mut PgConnection, task_id: Uuid) -> ApiResult<TaskRow> {
    sqlx::query_as::<_, TaskRow>(&format!("SELECT {} FROM tasks WHERE tasks.id = $1", TASK_COLUMNS))
        .bind(task_id)
        .fetch_optional(conn)
        .await?
        .ok_or(ApiError::NotFound)
}

async fn notify_assignee(state: &AppState, task: &TaskRow, actor: &AuthUser) {
    let Some(assignee) = task.assigned_to.filter(|a| *a != actor.user_id) else {
        return;
    };

    notifications::notify(
        &state.pool,
        Some(&state.ws_state),
        NewNotification {
            user_id: assignee,
            kind: NotificationKind::TaskAssigned,
            title: format!("Новая задача: {}", task.title),
            body: format!("Назначил(а): {}", actor.full_name),
            target: Some(NotificationTarget::Task(task.id)),
        },
    )
    .await;
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(filter): Query<TaskFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<TaskRow>>> {
    let assigned_to = if filter.mine.unwrap_or(false) {
        Some(auth_user.user_id)
    } else {
        filter.assigned_to
    };

    const WHERE: &str = r#"
        WHERE ($1::varchar IS NULL OR tasks.status = $1)
          AND ($2::uuid IS NULL OR tasks.assigned_to = $2)
          AND ($3::uuid IS NULL OR tasks.client_id = $3)
          AND ($4::uuid IS NULL OR tasks.ticket_id = $4)
          AND (NOT $5 OR (tasks.due_at < NOW() AND tasks.status IN ('todo', 'in_progress')))
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tasks {}", WHERE))
        .bind(filter.status)
        .bind(assigned_to)
        .bind(filter.client_id)
        .bind(filter.ticket_id)
        .bind(filter.overdue.unwrap_or(false))
        .fetch_one(&state.pool)
        .await?;

    let tasks = sqlx::query_as::<_, TaskRow>(&format!(
        r#"
        SELECT {} FROM tasks
        {}
        ORDER BY tasks.due_at ASC NULLS LAST, tasks.created_at DESC
        LIMIT $6 OFFSET $7
        "#,
        TASK_COLUMNS, WHERE
    ))
    .bind(filter.status)
    .bind(assigned_to)
    .bind(filter.client_id)
    .bind(filter.ticket_id)
    .bind(filter.overdue.unwrap_or(false))
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(tasks, total, &page)))
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Json<TaskRow>> {
    let title = validate_title(&req.title)?;

    // Unknown client, ticket or assignee ids fail the foreign keys (400)
    let task = sqlx::query_as::<_, TaskRow>(&format!(
        r#"
        INSERT INTO tasks (title, description, priority, due_at, client_id, ticket_id,
                           assigned_to, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        TASK_COLUMNS
    ))
    .bind(&title)
    .bind(&req.description)
    .bind(req.priority.unwrap_or_default())
    .bind(req.due_at)
    .bind(req.client_id)
    .bind(req.ticket_id)
    .bind(req.assigned_to)
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;

    notify_assignee(&state, &task, &auth_user).await;

    tracing::info!(task_id = %task.id, assigned_to = ?task.assigned_to, "Task created");
    Ok(Json(task))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskRow>> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(fetch_task(&mut conn, task_id).await?))
}

pub async fn update_task(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Json<TaskRow>> {
    let title = req.title.as_deref().map(validate_title).transpose()?;

    let mut tx = state.pool.begin().await?;
    let current = fetch_task(&mut tx, task_id).await?;
    ensure_can_edit(&auth_user, &current)?;

    let due_at = req.due_at.unwrap_or(current.due_at);
    let assigned_to = req.assigned_to.unwrap_or(current.assigned_to);

    sqlx::query(
        r#"
        UPDATE tasks
        SET title = $2, description = COALESCE($3, description), priority = $4,
            due_at = $5, assigned_to = $6,
            due_notified_at = CASE WHEN due_at IS DISTINCT FROM $5 THEN NULL ELSE due_notified_at END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(title.unwrap_or(current.title.clone()))
    .bind(&req.description)
    .bind(req.priority.unwrap_or(current.priority))
    .bind(due_at)
    .bind(assigned_to)
    .execute(&mut *tx)
    .await?;

    let task = fetch_task(&mut tx, task_id).await?;
    tx.commit().await?;

    if task.assigned_to != current.assigned_to {
        notify_assignee(&state, &task, &auth_user).await;
    }

    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    let mut conn = state.pool.acquire().await?;
    let task = fetch_task(&mut conn, task_id).await?;
    if task.created_by != auth_user.user_id {
        auth_user.require_supervisor()?;
    }

    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    tracing::info!(task_id = %task_id, deleted_by = %auth_user.user_id, "Task deleted");
    Ok(Json(MessageResponse::new("Task deleted")))
}

/// Any status may follow any other; `completed_at` tracks `done`
pub async fn change_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<ChangeTaskStatusRequest>,
) -> ApiResult<Json<TaskRow>> {
    let mut tx = state.pool.begin().await?;
    let current = fetch_task(&mut tx, task_id).await?;
    ensure_can_edit(&auth_user, &current)?;

    sqlx::query(
        r#"
        UPDATE tasks
        SET status = $2,
            completed_at = CASE WHEN $2 = 'done' THEN COALESCE(completed_at, NOW()) ELSE NULL END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(req.status)
    .execute(&mut *tx)
    .await?;

    let task = fetch_task(&mut tx, task_id).await?;
    tx.commit().await?;

    tracing::info!(task_id = %task_id, status = ?task.status, "Task status changed");
    Ok(Json(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use linedesk_shared::RoleLevel;

    fn user(role: RoleLevel) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "user@example.com".into(),
            full_name: "User".into(),
            role,
            role_name: "operator".into(),
            line_id: None,
        }
    }

    fn task(created_by: Uuid, assigned_to: Option<Uuid>) -> TaskRow {
        TaskRow {
            id: Uuid::new_v4(),
            title: "Перезвонить клиенту".into(),
            description: None,
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            due_at: None,
            client_id: None,
            ticket_id: None,
            assigned_to,
            assigned_to_name: None,
            created_by,
            completed_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_edit_permissions() {
        let creator = user(RoleLevel::Operator);
        let assignee = user(RoleLevel::Operator);
        let stranger = user(RoleLevel::Operator);
        let supervisor = user(RoleLevel::Supervisor);
        let t = task(creator.user_id, Some(assignee.user_id));

        assert!(ensure_can_edit(&creator, &t).is_ok());
        assert!(ensure_can_edit(&assignee, &t).is_ok());
        assert!(ensure_can_edit(&supervisor, &t).is_ok());
        assert!(matches!(ensure_can_edit(&stranger, &t), Err(ApiError::Forbidden)));
    }

    #[test]
    fn test_update_due_at_null_vs_absent() {
        let req: UpdateTaskRequest = serde_json::from_str(r#"{"due_at": null}"#).unwrap();
        assert_eq!(req.due_at, Some(None));

        let req: UpdateTaskRequest =
            serde_json::from_str(r#"{"due_at": "2024-06-01T09:00:00Z"}"#).unwrap();
        assert_eq!(req.due_at.flatten().unwrap().unix_timestamp(), 1_717_232_400);

        let req: UpdateTaskRequest = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(req.due_at, None);
    }

    #[test]
    fn test_title_validation() {
        assert!(validate_title("  ").is_err());
        assert_eq!(validate_title(" Позвонить ").unwrap(), "Позвонить");
        assert!(validate_title(&"x".repeat(TITLE_MAX_CHARS + 1)).is_err());
    }
}
