//! Sales funnels and their ordered stages

use std::collections::HashSet;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use linedesk_shared::TicketStatus;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{double_option, MessageResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const NAME_MAX_CHARS: usize = 128;
const COLOR_MAX_CHARS: usize = 16;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Serialize, FromRow)]
pub struct Funnel {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_default: bool,
    pub stage_count: i64,
    pub ticket_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const FUNNEL_COLUMNS: &str = r#"
    funnels.id, funnels.name, funnels.description, funnels.is_default,
    (SELECT COUNT(*) FROM funnel_stages s WHERE s.funnel_id = funnels.id) AS stage_count,
    (SELECT COUNT(*) FROM tickets t WHERE t.funnel_id = funnels.id) AS ticket_count,
    funnels.created_at, funnels.updated_at
"#;

#[derive(Debug, Serialize, FromRow)]
pub struct Stage {
    pub id: Uuid,
    pub funnel_id: Uuid,
    pub name: String,
    pub position: i32,
    pub trigger_status: Option<TicketStatus>,
    pub color: Option<String>,
    pub ticket_count: i64,
}

const STAGE_COLUMNS: &str = r#"
    funnel_stages.id, funnel_stages.funnel_id, funnel_stages.name, funnel_stages.position,
    funnel_stages.trigger_status, funnel_stages.color,
    (SELECT COUNT(*) FROM tickets t WHERE t.stage_id = funnel_stages.id) AS ticket_count
"#;

#[derive(Debug, Serialize)]
pub struct FunnelDetail {
    #[serde(flatten)]
    pub funnel: Funnel,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFunnelRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Optional initial stages, in order
    #[serde(default)]
    pub stages: Vec<StageFields>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFunnelRequest {
    pub name: Option<String>,
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    pub is_default: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StageFields {
    pub name: String,
    pub trigger_status: Option<TicketStatus>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStageRequest {
    pub name: Option<String>,
    #[serde(default, with = "double_option")]
    pub trigger_status: Option<Option<TicketStatus>>,
    #[serde(default, with = "double_option")]
    pub color: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderStagesRequest {
    pub stage_ids: Vec<Uuid>,
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_name(name: &str, what: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation(format!("{} name is required", what)));
    }
    if name.chars().count() > NAME_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "{} name must be at most {} characters",
            what, NAME_MAX_CHARS
        )));
    }
    Ok(name.to_string())
}

fn clean_color(color: Option<String>) -> ApiResult<Option<String>> {
    let color = color.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    if color
        .as_deref()
        .is_some_and(|c| c.chars().count() > COLOR_MAX_CHARS)
    {
        return Err(ApiError::Validation("Color is too long".into()));
    }
    Ok(color)
}

/// The requested order must name every stage of the funnel exactly once
fn check_stage_order(existing: &[Uuid], requested: &[Uuid]) -> ApiResult<()> {
    let requested_set: HashSet<&Uuid> = requested.iter().collect();
    if requested_set.len() != requested.len() {
        return Err(ApiError::Validation("Stage list contains duplicates".into()));
    }
    let existing_set: HashSet<&Uuid> = existing.iter().collect();
    if requested_set != existing_set {
        return Err(ApiError::Validation(
            "Stage list must contain every stage of the funnel".into(),
        ));
    }
    Ok(())
}

async fn fetch_funnel(conn: &mut PgConnection, funnel_id: Uuid) -> ApiResult<Funnel> {
    sqlx::query_as::<_, Funnel>(&format!(
        "SELECT {} FROM funnels WHERE funnels.id = $1",
        FUNNEL_COLUMNS
    ))
    .bind(funnel_id)
    .fetch_optional(conn)
    .await?
    .ok_or(ApiError::NotFound)
}

async fn fetch_stages(conn: &mut PgConnection, funnel_id: Uuid) -> ApiResult<Vec<Stage>> {
    let stages = sqlx::query_as::<_, Stage>(&format!(
        "SELECT {} FROM funnel_stages WHERE funnel_id = $1 ORDER BY position",
        STAGE_COLUMNS
    ))
    .bind(funnel_id)
    .fetch_all(conn)
    .await?;
    Ok(stages)
}

async fn fetch_stage(conn: &mut PgConnection, funnel_id: Uuid, stage_id: Uuid) -> ApiResult<Stage> {
    sqlx::query_as::<_, Stage>(&format!(
        "SELECT {} FROM funnel_stages WHERE id = $1 AND funnel_id = $2",
        STAGE_COLUMNS
    ))
    .bind(stage_id)
    .bind(funnel_id)
    .fetch_optional(conn)
    .await?
    .ok_or(ApiError::NotFound)
}

/// Keep a single default funnel; runs before the new default is written
async fn clear_other_defaults(conn: &mut PgConnection, keep: Option<Uuid>) -> ApiResult<()> {
    sqlx::query(
        r#"
        UPDATE funnels SET is_default = FALSE, updated_at = NOW()
        WHERE is_default AND ($1::uuid IS NULL OR id <> $1)
        "#,
    )
    .bind(keep)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_stage(
    conn: &mut PgConnection,
    funnel_id: Uuid,
    fields: StageFields,
) -> ApiResult<Uuid> {
    let name = validate_name(&fields.name, "Stage")?;
    let color = clean_color(fields.color)?;

    let stage_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO funnel_stages (funnel_id, name, position, trigger_status, color)
        VALUES ($1, $2,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM funnel_stages WHERE funnel_id = $1),
                $3, $4)
        RETURNING id
        "#,
    )
    .bind(funnel_id)
    .bind(&name)
    .bind(fields.trigger_status)
    .bind(&color)
    .fetch_one(conn)
    .await?;
    Ok(stage_id)
}

// =============================================================================
// Funnel handlers
// =============================================================================

pub async fn list_funnels(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Funnel>>> {
    let funnels = sqlx::query_as::<_, Funnel>(&format!(
        "SELECT {} FROM funnels ORDER BY funnels.is_default DESC, funnels.name",
        FUNNEL_COLUMNS
    ))
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(funnels))
}

pub async fn create_funnel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateFunnelRequest>,
) -> ApiResult<Json<FunnelDetail>> {
    auth_user.require_supervisor()?;
    let name = validate_name(&req.name, "Funnel")?;
    let description = req
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    let mut tx = state.pool.begin().await?;
    if req.is_default {
        clear_other_defaults(&mut tx, None).await?;
    }

    let funnel_id: Uuid = sqlx::query_scalar(
        "INSERT INTO funnels (name, description, is_default) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(&name)
    .bind(&description)
    .bind(req.is_default)
    .fetch_one(&mut *tx)
    .await?;

    for stage in req.stages {
        insert_stage(&mut tx, funnel_id, stage).await?;
    }

    let funnel = fetch_funnel(&mut tx, funnel_id).await?;
    let stages = fetch_stages(&mut tx, funnel_id).await?;
    tx.commit().await?;

    tracing::info!(funnel_id = %funnel_id, stages = stages.len(), "Funnel created");
    Ok(Json(FunnelDetail { funnel, stages }))
}

pub async fn get_funnel(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(funnel_id): Path<Uuid>,
) -> ApiResult<Json<FunnelDetail>> {
    let mut conn = state.pool.acquire().await?;
    let funnel = fetch_funnel(&mut conn, funnel_id).await?;
    let stages = fetch_stages(&mut conn, funnel_id).await?;
    Ok(Json(FunnelDetail { funnel, stages }))
}

pub async fn update_funnel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(funnel_id): Path<Uuid>,
    Json(req): Json<UpdateFunnelRequest>,
) -> ApiResult<Json<Funnel>> {
    auth_user.require_supervisor()?;

    let mut tx = state.pool.begin().await?;
    let current = fetch_funnel(&mut tx, funnel_id).await?;

    let name = match req.name {
        Some(n) => validate_name(&n, "Funnel")?,
        None => current.name,
    };
    let description = match req.description {
        Some(d) => d.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
        None => current.description,
    };
    let is_default = req.is_default.unwrap_or(current.is_default);

    if is_default {
        clear_other_defaults(&mut tx, Some(funnel_id)).await?;
    }
    sqlx::query(
        "UPDATE funnels SET name = $2, description = $3, is_default = $4, updated_at = NOW() WHERE id = $1",
    )
    .bind(funnel_id)
    .bind(&name)
    .bind(&description)
    .bind(is_default)
    .execute(&mut *tx)
    .await?;

    let funnel = fetch_funnel(&mut tx, funnel_id).await?;
    tx.commit().await?;
    Ok(Json(funnel))
}

/// Tickets in the funnel keep their data; their funnel and stage are cleared
pub async fn delete_funnel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(funnel_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_supervisor()?;

    let result = sqlx::query("DELETE FROM funnels WHERE id = $1")
        .bind(funnel_id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound);
    }

    tracing::info!(funnel_id = %funnel_id, "Funnel deleted");
    Ok(Json(MessageResponse::new("Funnel deleted")))
}

// =============================================================================
// Stage handlers
// =============================================================================

/// Append a stage at the end of the funnel
pub async fn create_stage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(funnel_id): Path<Uuid>,
    Json(req): Json<StageFields>,
) -> ApiResult<Json<Stage>> {
    auth_user.require_supervisor()?;

    let mut tx = state.pool.begin().await?;
    // Lock the funnel so concurrent appends get distinct positions
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM funnels WHERE id = $1 FOR UPDATE")
        .bind(funnel_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound)?;

    let stage_id = insert_stage(&mut tx, funnel_id, req).await?;
    let stage = fetch_stage(&mut tx, funnel_id, stage_id).await?;
    tx.commit().await?;

    Ok(Json(stage))
}

pub async fn update_stage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((funnel_id, stage_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateStageRequest>,
) -> ApiResult<Json<Stage>> {
    auth_user.require_supervisor()?;

    let mut conn = state.pool.acquire().await?;
    let current = fetch_stage(&mut conn, funnel_id, stage_id).await?;

    let name = match req.name {
        Some(n) => validate_name(&n, "Stage")?,
        None => current.name,
    };
    let trigger_status = req.trigger_status.unwrap_or(current.trigger_status);
    let color = match req.color {
        Some(c) => clean_color(c)?,
        None => current.color,
    };

    sqlx::query(
        r#"
        UPDATE funnel_stages
        SET name = $3, trigger_status = $4, color = $5, updated_at = NOW()
        WHERE id = $1 AND funnel_id = $2
        "#,
    )
    .bind(stage_id)
    .bind(funnel_id)
    .bind(&name)
    .bind(trigger_status)
    .bind(&color)
    .execute(&mut *conn)
    .await?;

    Ok(Json(fetch_stage(&mut conn, funnel_id, stage_id).await?))
}

/// Remove a stage and close the gap in positions
pub async fn delete_stage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((funnel_id, stage_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_supervisor()?;

    let mut tx = state.pool.begin().await?;
    let stage = fetch_stage(&mut tx, funnel_id, stage_id).await?;

    sqlx::query("DELETE FROM funnel_stages WHERE id = $1")
        .bind(stage_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE funnel_stages SET position = position - 1 WHERE funnel_id = $1 AND position > $2",
    )
    .bind(funnel_id)
    .bind(stage.position)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(MessageResponse::new("Stage deleted")))
}

/// Rewrite positions from an ordered list of stage ids
pub async fn reorder_stages(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(funnel_id): Path<Uuid>,
    Json(req): Json<ReorderStagesRequest>,
) -> ApiResult<Json<Vec<Stage>>> {
    auth_user.require_supervisor()?;

    let mut tx = state.pool.begin().await?;
    let existing: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM funnel_stages WHERE funnel_id = $1 FOR UPDATE")
            .bind(funnel_id)
            .fetch_all(&mut *tx)
            .await?;
    if existing.is_empty() {
        fetch_funnel(&mut tx, funnel_id).await?;
    }
    check_stage_order(&existing, &req.stage_ids)?;

    sqlx::query(
        r#"
        UPDATE funnel_stages s
        SET position = o.position::int, updated_at = NOW()
        FROM UNNEST($2::uuid[]) WITH ORDINALITY AS o(id, position)
        WHERE s.id = o.id AND s.funnel_id = $1
        "#,
    )
    .bind(funnel_id)
    .bind(&req.stage_ids)
    .execute(&mut *tx)
    .await?;

    let stages = fetch_stages(&mut tx, funnel_id).await?;
    tx.commit().await?;
    Ok(Json(stages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_must_match_exactly() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let existing = vec![a, b, c];

        assert!(check_stage_order(&existing, &[c, a, b]).is_ok());
        assert!(check_stage_order(&existing, &[a, b]).is_err());
        assert!(check_stage_order(&existing, &[a, a, b, c]).is_err());
        assert!(check_stage_order(&existing, &[a, b, Uuid::new_v4()]).is_err());
        assert!(check_stage_order(&[], &[]).is_ok());
    }

    #[test]
    fn test_name_and_color_validation() {
        assert_eq!(validate_name(" Лиды ", "Funnel").unwrap(), "Лиды");
        assert!(validate_name("", "Stage").is_err());
        assert_eq!(clean_color(Some("#22c55e".into())).unwrap(), Some("#22c55e".into()));
        assert_eq!(clean_color(Some(" ".into())).unwrap(), None);
        assert!(clean_color(Some("x".repeat(COLOR_MAX_CHARS + 1))).is_err());
    }

    #[test]
    fn test_stage_update_can_clear_trigger() {
        let req: UpdateStageRequest =
            serde_json::from_str(r#"{"trigger_status": null}"#).unwrap();
        assert_eq!(req.trigger_status, Some(None));

        let req: UpdateStageRequest =
            serde_json::from_str(r#"{"trigger_status": "resolved"}"#).unwrap();
        assert_eq!(req.trigger_status, Some(Some(TicketStatus::Resolved)));
    }
}
