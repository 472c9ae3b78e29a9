//! WhatsApp Business templates and broadcast campaigns

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{
    workflow::count_template_variables, CampaignStatus, PageParams, PaginatedResponse,
    TemplateCategory, TemplateStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::MessageResponse;
use crate::{
    auth::AuthUser,
    channels::whatsapp::{RemoteTemplate, TemplateSubmission},
    error::{ApiError, ApiResult},
    services::campaigns::{self, CampaignRow, NewCampaign, RecipientRow, CAMPAIGN_COLUMNS},
    state::AppState,
};

const TEMPLATE_NAME_MAX_CHARS: usize = 512;
const TEMPLATE_BODY_MAX_CHARS: usize = 1024;
const TEMPLATE_HEADER_MAX_CHARS: usize = 60;
const TEMPLATE_FOOTER_MAX_CHARS: usize = 60;

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Serialize, FromRow)]
pub struct TemplateRow {
    pub id: Uuid,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub header: Option<String>,
    pub body: String,
    pub footer: Option<String>,
    pub variables_count: i32,
    pub status: TemplateStatus,
    pub external_id: Option<String>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const TEMPLATE_COLUMNS: &str = r#"
    id, name, language, category, header, body, footer, variables_count, status,
    external_id, rejection_reason, created_at, updated_at
"#;

#[derive(Debug, Default, Deserialize)]
pub struct TemplateFilter {
    pub status: Option<TemplateStatus>,
    pub category: Option<TemplateCategory>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub header: Option<String>,
    pub body: String,
    pub footer: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncSummary {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

/// Meta accepts lower-case latin letters, digits and underscores
fn validate_template_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > TEMPLATE_NAME_MAX_CHARS {
        return Err(ApiError::Validation("Template name is required".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ApiError::Validation(
            "Template name may contain only lower-case latin letters, digits and underscores"
                .into(),
        ));
    }
    Ok(name.to_string())
}

fn optional_part(value: Option<String>, what: &str, max: usize) -> ApiResult<Option<String>> {
    let value = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    if value.as_deref().is_some_and(|v| v.chars().count() > max) {
        return Err(ApiError::Validation(format!(
            "Template {} must be at most {} characters",
            what, max
        )));
    }
    Ok(value)
}

fn validate_body(body: &str) -> ApiResult<String> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::Validation("Template body is required".into()));
    }
    if body.chars().count() > TEMPLATE_BODY_MAX_CHARS {
        return Err(ApiError::Validation(format!(
            "Template body must be at most {} characters",
            TEMPLATE_BODY_MAX_CHARS
        )));
    }
    Ok(body.to_string())
}

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Query(filter): Query<TemplateFilter>,
) -> ApiResult<Json<Vec<TemplateRow>>> {
    let templates = sqlx::query_as::<_, TemplateRow>(&format!(
        r#"
        SELECT {} FROM waba_templates
        WHERE ($1::varchar IS NULL OR status = $1)
          AND ($2::varchar IS NULL OR category = $2)
        ORDER BY name, language
        "#,
        TEMPLATE_COLUMNS
    ))
    .bind(filter.status)
    .bind(filter.category)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(templates))
}

/// Submit a template for Meta review and keep a local copy
pub async fn create_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<Json<TemplateRow>> {
    auth_user.require_supervisor()?;

    let name = validate_template_name(&req.name)?;
    let language = req.language.trim().to_string();
    if language.is_empty() {
        return Err(ApiError::Validation("Template language is required".into()));
    }
    let header = optional_part(req.header, "header", TEMPLATE_HEADER_MAX_CHARS)?;
    let footer = optional_part(req.footer, "footer", TEMPLATE_FOOTER_MAX_CHARS)?;
    let body = validate_body(&req.body)?;
    let variables_count = count_template_variables(&body);

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM waba_templates WHERE name = $1 AND language = $2)",
    )
    .bind(&name)
    .bind(&language)
    .fetch_one(&state.pool)
    .await?;
    if exists {
        return Err(ApiError::Conflict(format!(
            "Template {} ({}) already exists",
            name, language
        )));
    }

    let (external_id, status) = state
        .channels
        .whatsapp
        .create_template(&TemplateSubmission {
            name: &name,
            language: &language,
            category: req.category,
            header: header.as_deref(),
            body: &body,
            footer: footer.as_deref(),
            variables_count,
        })
        .await?;

    let template = sqlx::query_as::<_, TemplateRow>(&format!(
        r#"
        INSERT INTO waba_templates
            (name, language, category, header, body, footer, variables_count, status, external_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {}
        "#,
        TEMPLATE_COLUMNS
    ))
    .bind(&name)
    .bind(&language)
    .bind(req.category)
    .bind(&header)
    .bind(&body)
    .bind(&footer)
    .bind(variables_count as i32)
    .bind(status)
    .bind(&external_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        template_id = %template.id,
        name = %template.name,
        status = ?template.status,
        "WABA template submitted"
    );
    Ok(Json(template))
}

/// Upsert one remote template; returns true when a new row was inserted
async fn upsert_remote(state: &AppState, remote: &RemoteTemplate) -> ApiResult<bool> {
    let variables_count = count_template_variables(&remote.body) as i32;
    let inserted: bool = sqlx::query_scalar(
        r#"
        INSERT INTO waba_templates
            (name, language, category, header, body, footer, variables_count,
             status, external_id, rejection_reason)
        VALUES ($1, $2, COALESCE($3, 'utility'), $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (name, language) DO UPDATE
        SET category = COALESCE($3, waba_templates.category),
            header = EXCLUDED.header,
            body = EXCLUDED.body,
            footer = EXCLUDED.footer,
            variables_count = EXCLUDED.variables_count,
            status = EXCLUDED.status,
            external_id = EXCLUDED.external_id,
            rejection_reason = EXCLUDED.rejection_reason,
            updated_at = NOW()
        RETURNING (xmax = 0)
        "#,
    )
    .bind(&remote.name)
    .bind(&remote.language)
    .bind(remote.category)
    .bind(&remote.header)
    .bind(&remote.body)
    .bind(&remote.footer)
    .bind(variables_count)
    .bind(remote.status)
    .bind(&remote.external_id)
    .bind(&remote.rejection_reason)
    .fetch_one(&state.pool)
    .await?;
    Ok(inserted)
}

/// Pull template statuses from the WABA account
pub async fn sync_templates(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SyncSummary>> {
    auth_user.require_supervisor()?;

    let remote = state.channels.whatsapp.list_templates().await?;
    let mut summary = SyncSummary {
        fetched: remote.len(),
        ..Default::default()
    };

    for template in &remote {
        if upsert_remote(&state, template).await? {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
    }

    tracing::info!(
        fetched = summary.fetched,
        created = summary.created,
        updated = summary.updated,
        "WABA templates synced"
    );
    Ok(Json(summary))
}

/// Delete locally and, when the template was submitted, on the WABA account
pub async fn delete_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(template_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_supervisor()?;

    let template = sqlx::query_as::<_, TemplateRow>(&format!(
        "SELECT {} FROM waba_templates WHERE id = $1",
        TEMPLATE_COLUMNS
    ))
    .bind(template_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)?;

    let in_use: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM waba_campaigns WHERE template_id = $1)",
    )
    .bind(template_id)
    .fetch_one(&state.pool)
    .await?;
    if in_use {
        return Err(ApiError::Conflict(
            "Template is used by a campaign and cannot be deleted".into(),
        ));
    }

    if template.external_id.is_some() {
        state
            .channels
            .whatsapp
            .delete_template(&template.name)
            .await?;
    }

    sqlx::query("DELETE FROM waba_templates WHERE id = $1")
        .bind(template_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(template_id = %template_id, name = %template.name, "WABA template deleted");
    Ok(Json(MessageResponse::new("Template deleted")))
}

// =============================================================================
// Campaigns
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CampaignFilter {
    pub status: Option<CampaignStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub variables: Vec<String>,
    pub client_ids: Vec<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct CampaignDetail {
    #[serde(flatten)]
    pub campaign: CampaignRow,
    pub recipients: Vec<RecipientRow>,
}

pub async fn list_campaigns(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Query(filter): Query<CampaignFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<CampaignRow>>> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM waba_campaigns WHERE ($1::varchar IS NULL OR status = $1)",
    )
    .bind(filter.status)
    .fetch_one(&state.pool)
    .await?;

    let campaigns = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        SELECT {} FROM waba_campaigns
        WHERE ($1::varchar IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
        CAMPAIGN_COLUMNS
    ))
    .bind(filter.status)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(campaigns, total, &page)))
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCampaignRequest>,
) -> ApiResult<Json<CampaignRow>> {
    auth_user.require_supervisor()?;

    let campaign = campaigns::create_campaign(
        &state.pool,
        &auth_user,
        NewCampaign {
            name: req.name,
            template_id: req.template_id,
            variables: req.variables,
            client_ids: req.client_ids,
            scheduled_at: req.scheduled_at,
        },
    )
    .await?;

    Ok(Json(campaign))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignDetail>> {
    let campaign = campaigns::get_campaign(&state.pool, campaign_id).await?;
    let recipients = campaigns::recipients(&state.pool, campaign_id).await?;
    Ok(Json(CampaignDetail {
        campaign,
        recipients,
    }))
}

/// Deliver now; the response carries the final counters
pub async fn launch_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignRow>> {
    auth_user.require_supervisor()?;
    let campaign =
        campaigns::launch(&state.pool, &state.channels.whatsapp, campaign_id).await?;
    Ok(Json(campaign))
}

pub async fn cancel_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignRow>> {
    auth_user.require_supervisor()?;
    Ok(Json(campaigns::cancel(&state.pool, campaign_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_name_rules() {
        assert_eq!(validate_template_name(" order_ready_2 ").unwrap(), "order_ready_2");
        assert!(validate_template_name("Order Ready").is_err());
        assert!(validate_template_name("заказ").is_err());
        assert!(validate_template_name("").is_err());
    }

    #[test]
    fn test_template_parts() {
        assert!(validate_body("  ").is_err());
        assert!(validate_body(&"x".repeat(TEMPLATE_BODY_MAX_CHARS + 1)).is_err());
        assert_eq!(
            optional_part(Some("  ".into()), "header", TEMPLATE_HEADER_MAX_CHARS).unwrap(),
            None
        );
        assert!(optional_part(
            Some("h".repeat(TEMPLATE_HEADER_MAX_CHARS + 1)),
            "header",
            TEMPLATE_HEADER_MAX_CHARS
        )
        .is_err());
    }

    #[test]
    fn test_campaign_request_defaults() {
        let req: CreateCampaignRequest = serde_json::from_str(&format!(
            r#"{{"name": "Акция", "template_id": "{}", "client_ids": []}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert!(req.variables.is_empty());
        assert!(req.scheduled_at.is_none());
    }
}
