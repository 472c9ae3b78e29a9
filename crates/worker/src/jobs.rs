//! Background jobs
//!
//! Each job is a plain async function over the pool so it can be run from
//! the scheduler or called directly in tests.

use linedesk_api::{
    channels::WhatsAppClient,
    email::ReportMailer,
    services::{
        campaigns,
        notifications::{self, NewNotification, NotificationTarget},
        reports,
    },
};
use linedesk_shared::NotificationKind;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Read notifications older than this are removed
pub const NOTIFICATION_RETENTION_DAYS: i32 = 90;

/// Run every scheduled report whose time has come
pub async fn run_due_reports(pool: &PgPool, mailer: &ReportMailer) -> anyhow::Result<usize> {
    let runs = reports::run_due(pool, mailer).await?;
    if runs > 0 {
        tracing::info!(runs = runs, "Scheduled reports delivered");
    }
    Ok(runs)
}

/// Deliver campaigns whose `scheduled_at` has passed
pub async fn dispatch_due_campaigns(pool: &PgPool, whatsapp: &WhatsAppClient) -> anyhow::Result<usize> {
    let dispatched = campaigns::dispatch_due(pool, whatsapp).await?;
    if dispatched > 0 {
        tracing::info!(campaigns = dispatched, "Scheduled campaigns dispatched");
    }
    Ok(dispatched)
}

#[derive(Debug, FromRow)]
struct DueTask {
    id: Uuid,
    title: String,
    assigned_to: Uuid,
}

fn due_notification(task: &DueTask) -> NewNotification {
    NewNotification {
        user_id: task.assigned_to,
        kind: NotificationKind::TaskDue,
        title: format!("Срок задачи истёк: {}", task.title),
        body: String::new(),
        target: Some(NotificationTarget::Task(task.id)),
    }
}

/// Notify assignees of open tasks that passed their due time, once per due time.
///
/// Claiming and marking happen in one statement, so concurrent workers never
/// notify the same task twice.
pub async fn notify_due_tasks(pool: &PgPool) -> anyhow::Result<usize> {
    let due = sqlx::query_as::<_, DueTask>(
        r#"
        UPDATE tasks
        SET due_notified_at = NOW()
        WHERE id IN (
            SELECT id FROM tasks
            WHERE due_at <= NOW()
              AND due_notified_at IS NULL
              AND assigned_to IS NOT NULL
              AND status IN ('todo', 'in_progress')
            ORDER BY due_at
            LIMIT 500
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, title, assigned_to
        "#,
    )
    .fetch_all(pool)
    .await?;

    for task in &due {
        // The worker has no live sockets; clients pick these up on their next fetch
        notifications::notify(pool, None, due_notification(task)).await;
    }

    if !due.is_empty() {
        tracing::info!(tasks = due.len(), "Due task notifications sent");
    }
    Ok(due.len())
}

/// Drop read notifications past the retention window
pub async fn cleanup_notifications(pool: &PgPool, retention_days: i32) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM notifications
        WHERE is_read AND created_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await?;

    tracing::info!(
        deleted = result.rows_affected(),
        retention_days = retention_days,
        "Old notifications cleaned up"
    );
    Ok(result.rows_affected())
}

/// Drop refresh sessions that can no longer be used
pub async fn cleanup_sessions(pool: &PgPool) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM user_sessions WHERE revoked_at IS NOT NULL OR expires_at < NOW()",
    )
    .execute(pool)
    .await?;

    tracing::info!(deleted = result.rows_affected(), "Expired sessions cleaned up");
    Ok(result.rows_affected())
}
