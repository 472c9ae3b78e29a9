//! Report generation and scheduled delivery
//!
//! Reports are JSON payloads computed over a `[from, to)` period. Scheduled
//! reports are claimed by the worker with `FOR UPDATE SKIP LOCKED`, stored as
//! a run and e-mailed to their recipients.

use linedesk_shared::{ReportFrequency, ReportRunStatus, ReportType};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::{FromRow, PgConnection, PgPool};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{
    email::ReportMailer,
    error::{ApiError, ApiResult},
};

pub const SCHEDULED_REPORT_COLUMNS: &str = r#"
    id, name, report_type, frequency, recipients, is_active, next_run_at, last_run_at,
    created_by, created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScheduledReportRow {
    pub id: Uuid,
    pub name: String,
    pub report_type: ReportType,
    pub frequency: ReportFrequency,
    pub recipients: Vec<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub next_run_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReportRunRow {
    pub id: Uuid,
    pub report_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub payload: Value,
    pub status: ReportRunStatus,
    pub error: Option<String>,
    pub delivered: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

fn counts_object(rows: Vec<(String, i64)>) -> Value {
    let map: Map<String, Value> = rows.into_iter().map(|(k, v)| (k, json!(v))).collect();
    Value::Object(map)
}

// =============================================================================
// Generation
// =============================================================================

async fn tickets_summary(
    conn: &mut PgConnection,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Value, sqlx::Error> {
    let by_status: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*) FROM tickets
        WHERE created_at >= $1 AND created_at < $2
        GROUP BY status
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    let by_priority: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT priority, COUNT(*) FROM tickets
        WHERE created_at >= $1 AND created_at < $2
        GROUP BY priority
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    let (created, resolved, avg_resolution_hours): (i64, i64, Option<f64>) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM tickets WHERE created_at >= $1 AND created_at < $2),
            (SELECT COUNT(*) FROM tickets WHERE resolved_at >= $1 AND resolved_at < $2),
            (SELECT AVG(EXTRACT(EPOCH FROM resolved_at - created_at))::float8 / 3600.0::float8
             FROM tickets WHERE resolved_at >= $1 AND resolved_at < $2)
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_one(&mut *conn)
    .await?;

    Ok(json!({
        "created": created,
        "resolved": resolved,
        "avg_resolution_hours": avg_resolution_hours,
        "by_status": counts_object(by_status),
        "by_priority": counts_object(by_priority),
    }))
}

async fn calls_summary(
    conn: &mut PgConnection,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Value, sqlx::Error> {
    let by_direction: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT direction, COUNT(*) FROM calls
        WHERE started_at >= $1 AND started_at < $2
        GROUP BY direction
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    let by_status: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT status, COUNT(*) FROM calls
        WHERE started_at >= $1 AND started_at < $2
        GROUP BY status
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    let (total, missed, avg_talk_seconds): (i64, i64, Option<f64>) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE status = 'missed'),
               (AVG(talk_seconds) FILTER (WHERE talk_seconds > 0))::float8
        FROM calls
        WHERE started_at >= $1 AND started_at < $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_one(&mut *conn)
    .await?;

    Ok(json!({
        "total": total,
        "missed": missed,
        "avg_talk_seconds": avg_talk_seconds,
        "by_direction": counts_object(by_direction),
        "by_status": counts_object(by_status),
    }))
}

async fn operator_performance(
    conn: &mut PgConnection,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Value, sqlx::Error> {
    #[derive(FromRow, Serialize)]
    struct OperatorStats {
        user_id: Uuid,
        full_name: String,
        tickets_assigned: i64,
        tickets_resolved: i64,
        messages_sent: i64,
        calls_answered: i64,
    }

    let operators = sqlx::query_as::<_, OperatorStats>(
        r#"
        SELECT u.id AS user_id, u.full_name,
            (SELECT COUNT(*) FROM tickets t
             WHERE t.assigned_to = u.id AND t.created_at >= $1 AND t.created_at < $2) AS tickets_assigned,
            (SELECT COUNT(*) FROM tickets t
             WHERE t.assigned_to = u.id AND t.resolved_at >= $1 AND t.resolved_at < $2) AS tickets_resolved,
            (SELECT COUNT(*) FROM messages m
             WHERE m.sender_id = u.id AND m.direction = 'outbound'
               AND m.created_at >= $1 AND m.created_at < $2) AS messages_sent,
            (SELECT COUNT(*) FROM calls c
             WHERE c.operator_id = u.id AND c.answered_at IS NOT NULL
               AND c.started_at >= $1 AND c.started_at < $2) AS calls_answered
        FROM users u
        WHERE u.is_active
        ORDER BY tickets_resolved DESC, u.full_name
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    Ok(json!({ "operators": operators }))
}

async fn campaigns_summary(
    conn: &mut PgConnection,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Value, sqlx::Error> {
    #[derive(FromRow, Serialize)]
    struct CampaignStats {
        id: Uuid,
        name: String,
        status: String,
        total_recipients: i32,
        sent_count: i32,
        failed_count: i32,
    }

    let campaigns = sqlx::query_as::<_, CampaignStats>(
        r#"
        SELECT id, name, status, total_recipients, sent_count, failed_count
        FROM waba_campaigns
        WHERE finished_at >= $1 AND finished_at < $2
        ORDER BY finished_at
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&mut *conn)
    .await?;

    let sent: i64 = campaigns.iter().map(|c| i64::from(c.sent_count)).sum();
    let failed: i64 = campaigns.iter().map(|c| i64::from(c.failed_count)).sum();

    Ok(json!({
        "campaigns": campaigns,
        "sent": sent,
        "failed": failed,
    }))
}

/// Compute a report over `[from, to)`
pub async fn generate(
    conn: &mut PgConnection,
    report_type: ReportType,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> ApiResult<Value> {
    if from >= to {
        return Err(ApiError::Validation("Report period is empty".into()));
    }

    let data = match report_type {
        ReportType::TicketsSummary => tickets_summary(conn, from, to).await?,
        ReportType::CallsSummary => calls_summary(conn, from, to).await?,
        ReportType::OperatorPerformance => operator_performance(conn, from, to).await?,
        ReportType::CampaignsSummary => campaigns_summary(conn, from, to).await?,
    };

    Ok(json!({
        "report_type": report_type,
        "title": report_type.title(),
        "period": { "from": rfc3339(from), "to": rfc3339(to) },
        "data": data,
    }))
}

// =============================================================================
// Scheduled reports
// =============================================================================

/// First scheduled time after `now`, keeping the report's time of day
pub fn advance_next_run(
    frequency: ReportFrequency,
    scheduled: OffsetDateTime,
    now: OffsetDateTime,
) -> OffsetDateTime {
    let mut next = frequency.next_run_after(scheduled);
    while next <= now {
        next = frequency.next_run_after(next);
    }
    next
}

/// Generate, store and e-mail one report.
///
/// With `advance` the schedule moves to the next slot; manual runs leave
/// the schedule alone.
pub async fn run_scheduled(
    conn: &mut PgConnection,
    mailer: &ReportMailer,
    report: &ScheduledReportRow,
    now: OffsetDateTime,
    advance: bool,
) -> ApiResult<ReportRunRow> {
    let (period_start, period_end) = report.frequency.period_ending(now);

    let (status, payload, error, delivered) =
        match generate(conn, report.report_type, period_start, period_end).await {
            Ok(payload) => {
                let delivered = if report.recipients.is_empty() || !mailer.is_enabled() {
                    false
                } else {
                    let period = format!("{} - {}", rfc3339(period_start), rfc3339(period_end));
                    match mailer
                        .send_report(&report.recipients, &report.name, &period, &payload)
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(report_id = %report.id, error = %e, "Report email failed");
                            false
                        }
                    }
                };
                (ReportRunStatus::Completed, payload, None, delivered)
            }
            Err(e) => {
                tracing::error!(report_id = %report.id, error = %e, "Report generation failed");
                (ReportRunStatus::Failed, json!({}), Some(e.to_string()), false)
            }
        };

    let run = sqlx::query_as::<_, ReportRunRow>(
        r#"
        INSERT INTO report_runs (report_id, period_start, period_end, payload, status, error, delivered)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, report_id, period_start, period_end, payload, status, error, delivered, created_at
        "#,
    )
    .bind(report.id)
    .bind(period_start)
    .bind(period_end)
    .bind(&payload)
    .bind(status)
    .bind(error)
    .bind(delivered)
    .fetch_one(&mut *conn)
    .await?;

    let next_run_at = if advance {
        advance_next_run(report.frequency, report.next_run_at, now)
    } else {
        report.next_run_at
    };
    sqlx::query(
        r#"
        UPDATE scheduled_reports
        SET last_run_at = $2, next_run_at = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(report.id)
    .bind(now)
    .bind(next_run_at)
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        report_id = %report.id,
        run_id = %run.id,
        status = ?run.status,
        delivered = run.delivered,
        next_run_at = %rfc3339(next_run_at),
        "Scheduled report run"
    );

    Ok(run)
}

/// Run every active report whose `next_run_at` has passed
pub async fn run_due(pool: &PgPool, mailer: &ReportMailer) -> ApiResult<usize> {
    let mut runs = 0;

    loop {
        let mut tx = pool.begin().await?;

        let due = sqlx::query_as::<_, ScheduledReportRow>(&format!(
            r#"
            SELECT {} FROM scheduled_reports
            WHERE is_active AND next_run_at <= NOW()
            ORDER BY next_run_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            SCHEDULED_REPORT_COLUMNS
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(report) = due else {
            tx.commit().await?;
            break;
        };

        run_scheduled(&mut tx, mailer, &report, OffsetDateTime::now_utc(), true).await?;
        tx.commit().await?;
        runs += 1;
    }

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_advance_next_run_skips_missed_slots() {
        let scheduled = datetime!(2024-06-01 08:00 UTC);

        let now = datetime!(2024-06-01 08:00:30 UTC);
        assert_eq!(
            advance_next_run(ReportFrequency::Daily, scheduled, now),
            datetime!(2024-06-02 08:00 UTC)
        );

        // Worker was down for three days
        let now = datetime!(2024-06-04 12:00 UTC);
        assert_eq!(
            advance_next_run(ReportFrequency::Daily, scheduled, now),
            datetime!(2024-06-05 08:00 UTC)
        );

        assert_eq!(
            advance_next_run(ReportFrequency::Weekly, scheduled, now),
            datetime!(2024-06-08 08:00 UTC)
        );
    }

    #[test]
    fn test_advance_monthly() {
        let scheduled = datetime!(2024-01-31 06:00 UTC);
        let now = datetime!(2024-01-31 06:01 UTC);
        assert_eq!(
            advance_next_run(ReportFrequency::Monthly, scheduled, now),
            datetime!(2024-02-29 06:00 UTC)
        );
    }

    #[test]
    fn test_counts_object() {
        let value = counts_object(vec![("open".into(), 3), ("closed".into(), 7)]);
        assert_eq!(value["open"], 3);
        assert_eq!(value["closed"], 7);
    }
}
