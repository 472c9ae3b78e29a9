//! On-demand reports and scheduled report management

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{PageParams, PaginatedResponse, ReportFrequency, ReportType};
use serde::Deserialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{users::validate_email, MessageResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::reports::{
        self, ReportRunRow, ScheduledReportRow, SCHEDULED_REPORT_COLUMNS,
    },
    state::AppState,
};

/// Period used when `from` is omitted
const DEFAULT_PERIOD_DAYS: i64 = 7;
const NAME_MAX_CHARS: usize = 255;
const MAX_RECIPIENTS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

impl PeriodQuery {
    fn resolve(&self, now: OffsetDateTime) -> ApiResult<(OffsetDateTime, OffsetDateTime)> {
        let to = self.to.unwrap_or(now);
        let from = self
            .from
            .unwrap_or(to - Duration::days(DEFAULT_PERIOD_DAYS));
        if from >= to {
            return Err(ApiError::Validation("`from` must be before `to`".into()));
        }
        Ok((from, to))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduledRequest {
    pub name: String,
    pub report_type: ReportType,
    pub frequency: ReportFrequency,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// First delivery; defaults to one period from now
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduledRequest {
    pub name: Option<String>,
    pub report_type: Option<ReportType>,
    pub frequency: Option<ReportFrequency>,
    pub recipients: Option<Vec<String>>,
    pub is_active: Option<bool>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

fn validate_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > NAME_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Report name must be 1 to {} characters",
            NAME_MAX_CHARS
        )));
    }
    Ok(name.to_string())
}

fn validate_recipients(recipients: Vec<String>) -> ApiResult<Vec<String>> {
    if recipients.len() > MAX_RECIPIENTS {
        return Err(ApiError::Validation(format!(
            "At most {} recipients are allowed",
            MAX_RECIPIENTS
        )));
    }
    let mut out: Vec<String> = Vec::with_capacity(recipients.len());
    for raw in recipients {
        let email = validate_email(&raw)?;
        if !out.contains(&email) {
            out.push(email);
        }
    }
    Ok(out)
}

async fn fetch_scheduled(state: &AppState, report_id: Uuid) -> ApiResult<ScheduledReportRow> {
    sqlx::query_as::<_, ScheduledReportRow>(&format!(
        "SELECT {} FROM scheduled_reports WHERE id = $1",
        SCHEDULED_REPORT_COLUMNS
    ))
    .bind(report_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)
}

// =============================================================================
// On-demand
// =============================================================================

pub async fn generate_report(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_type): Path<ReportType>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Json<Value>> {
    auth_user.require_supervisor()?;
    let (from, to) = period.resolve(OffsetDateTime::now_utc())?;

    let mut conn = state.pool.acquire().await?;
    let payload = reports::generate(&mut conn, report_type, from, to).await?;
    Ok(Json(payload))
}

// =============================================================================
// Scheduled
// =============================================================================

pub async fn list_scheduled(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ScheduledReportRow>>> {
    auth_user.require_supervisor()?;
    let reports = sqlx::query_as::<_, ScheduledReportRow>(&format!(
        "SELECT {} FROM scheduled_reports ORDER BY is_active DESC, next_run_at",
        SCHEDULED_REPORT_COLUMNS
    ))
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(reports))
}

pub async fn create_scheduled(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateScheduledRequest>,
) -> ApiResult<Json<ScheduledReportRow>> {
    auth_user.require_supervisor()?;

    let name = validate_name(&req.name)?;
    let recipients = validate_recipients(req.recipients)?;
    let now = OffsetDateTime::now_utc();
    let next_run_at = match req.next_run_at {
        Some(at) if at <= now => {
            return Err(ApiError::Validation("next_run_at must be in the future".into()))
        }
        Some(at) => at,
        None => req.frequency.next_run_after(now),
    };

    let report = sqlx::query_as::<_, ScheduledReportRow>(&format!(
        r#"
        INSERT INTO scheduled_reports (name, report_type, frequency, recipients, next_run_at, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        SCHEDULED_REPORT_COLUMNS
    ))
    .bind(&name)
    .bind(req.report_type)
    .bind(req.frequency)
    .bind(&recipients)
    .bind(next_run_at)
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(report_id = %report.id, report_type = ?report.report_type, "Scheduled report created");
    Ok(Json(report))
}

pub async fn get_scheduled(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<Json<ScheduledReportRow>> {
    auth_user.require_supervisor()?;
    Ok(Json(fetch_scheduled(&state, report_id).await?))
}

pub async fn update_scheduled(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
    Json(req): Json<UpdateScheduledRequest>,
) -> ApiResult<Json<ScheduledReportRow>> {
    auth_user.require_supervisor()?;
    let current = fetch_scheduled(&state, report_id).await?;

    let name = match req.name {
        Some(n) => validate_name(&n)?,
        None => current.name,
    };
    let recipients = match req.recipients {
        Some(r) => validate_recipients(r)?,
        None => current.recipients,
    };
    let frequency = req.frequency.unwrap_or(current.frequency);
    let is_active = req.is_active.unwrap_or(current.is_active);

    // A reactivated schedule must not fire for the slots it missed
    let now = OffsetDateTime::now_utc();
    let next_run_at = match req.next_run_at {
        Some(at) if at <= now => {
            return Err(ApiError::Validation("next_run_at must be in the future".into()))
        }
        Some(at) => at,
        None if current.next_run_at <= now => {
            reports::advance_next_run(frequency, current.next_run_at, now)
        }
        None => current.next_run_at,
    };

    let report = sqlx::query_as::<_, ScheduledReportRow>(&format!(
        r#"
        UPDATE scheduled_reports
        SET name = $2, report_type = $3, frequency = $4, recipients = $5,
            is_active = $6, next_run_at = $7, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        SCHEDULED_REPORT_COLUMNS
    ))
    .bind(report_id)
    .bind(&name)
    .bind(req.report_type.unwrap_or(current.report_type))
    .bind(frequency)
    .bind(&recipients)
    .bind(is_active)
    .bind(next_run_at)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(report))
}

pub async fn delete_scheduled(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_supervisor()?;

    let result = sqlx::query("DELETE FROM scheduled_reports WHERE id = $1")
        .bind(report_id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(Json(MessageResponse::new("Scheduled report deleted")))
}

/// Run history, newest first
pub async fn list_runs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<ReportRunRow>>> {
    auth_user.require_supervisor()?;
    fetch_scheduled(&state, report_id).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM report_runs WHERE report_id = $1")
        .bind(report_id)
        .fetch_one(&state.pool)
        .await?;

    let runs = sqlx::query_as::<_, ReportRunRow>(
        r#"
        SELECT id, report_id, period_start, period_end, payload, status, error, delivered, created_at
        FROM report_runs
        WHERE report_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(report_id)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(runs, total, &page)))
}

/// Run immediately without moving the schedule
pub async fn run_now(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<Json<ReportRunRow>> {
    auth_user.require_supervisor()?;

    let mut tx = state.pool.begin().await?;
    let report = sqlx::query_as::<_, ScheduledReportRow>(&format!(
        "SELECT {} FROM scheduled_reports WHERE id = $1 FOR UPDATE",
        SCHEDULED_REPORT_COLUMNS
    ))
    .bind(report_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::NotFound)?;

    let run = reports::run_scheduled(
        &mut tx,
        &state.mailer,
        &report,
        OffsetDateTime::now_utc(),
        false,
    )
    .await?;
    tx.commit().await?;

    Ok(Json(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_period_defaults_to_last_week() {
        let now = datetime!(2024-06-10 12:00 UTC);
        let (from, to) = PeriodQuery::default().resolve(now).unwrap();
        assert_eq!(to, now);
        assert_eq!(from, datetime!(2024-06-03 12:00 UTC));
    }

    #[test]
    fn test_period_rejects_inverted_range() {
        let now = datetime!(2024-06-10 12:00 UTC);
        let query = PeriodQuery {
            from: Some(datetime!(2024-06-09 00:00 UTC)),
            to: Some(datetime!(2024-06-01 00:00 UTC)),
        };
        assert!(query.resolve(now).is_err());
    }

    #[test]
    fn test_recipients_are_normalized_and_deduplicated() {
        let out = validate_recipients(vec![
            "Boss@Example.com".into(),
            " boss@example.com ".into(),
            "ops@example.com".into(),
        ])
        .unwrap();
        assert_eq!(out, vec!["boss@example.com", "ops@example.com"]);

        assert!(validate_recipients(vec!["not-an-email".into()]).is_err());
    }

    #[test]
    fn test_report_type_path_value() {
        let parsed: ReportType = serde_json::from_str(r#""operator_performance""#).unwrap();
        assert_eq!(parsed, ReportType::OperatorPerformance);
    }
}
