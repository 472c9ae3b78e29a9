//! Per-client AI auto-reply settings

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use linedesk_shared::workflow::apply_ai_toggle;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MODEL_MAX_CHARS: usize = 128;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AiSetting {
    pub client_id: Uuid,
    pub is_enabled: bool,
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub updated_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl AiSetting {
    /// What a client without a stored row gets
    fn disabled(client_id: Uuid) -> Self {
        Self {
            client_id,
            is_enabled: false,
            prompt: None,
            model: None,
            updated_by: None,
            updated_at: None,
        }
    }
}

const AI_SETTING_COLUMNS: &str = "client_id, is_enabled, prompt, model, updated_by, updated_at";

#[derive(Debug, Serialize, FromRow)]
pub struct EnabledClient {
    pub client_id: Uuid,
    pub client_name: String,
    pub model: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub is_enabled: bool,
    pub prompt: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub is_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub client_id: Uuid,
    pub is_enabled: bool,
    pub changed: bool,
}

fn clean_text(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_model(model: Option<String>) -> ApiResult<Option<String>> {
    let model = clean_text(model);
    if model
        .as_deref()
        .is_some_and(|m| m.chars().count() > MODEL_MAX_CHARS)
    {
        return Err(ApiError::Validation(format!(
            "Model name must be at most {} characters",
            MODEL_MAX_CHARS
        )));
    }
    Ok(model)
}

async fn ensure_client(state: &AppState, client_id: Uuid) -> ApiResult<()> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(client_id)
    .fetch_one(&state.pool)
    .await?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

async fn load_setting(state: &AppState, client_id: Uuid) -> ApiResult<Option<AiSetting>> {
    let setting = sqlx::query_as::<_, AiSetting>(&format!(
        "SELECT {} FROM ai_settings WHERE client_id = $1",
        AI_SETTING_COLUMNS
    ))
    .bind(client_id)
    .fetch_optional(&state.pool)
    .await?;
    Ok(setting)
}

// =============================================================================
// Handlers
// =============================================================================

/// Clients with auto-reply switched on
pub async fn list_enabled(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<EnabledClient>>> {
    let clients = sqlx::query_as::<_, EnabledClient>(
        r#"
        SELECT s.client_id, c.full_name AS client_name, s.model, s.updated_at
        FROM ai_settings s
        JOIN clients c ON c.id = s.client_id
        WHERE s.is_enabled AND c.deleted_at IS NULL
        ORDER BY c.full_name
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(clients))
}

pub async fn get_setting(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<AiSetting>> {
    ensure_client(&state, client_id).await?;
    let setting = load_setting(&state, client_id)
        .await?
        .unwrap_or_else(|| AiSetting::disabled(client_id));
    Ok(Json(setting))
}

pub async fn put_setting(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<PutSettingRequest>,
) -> ApiResult<Json<AiSetting>> {
    ensure_client(&state, client_id).await?;
    let model = validate_model(req.model)?;

    let setting = sqlx::query_as::<_, AiSetting>(&format!(
        r#"
        INSERT INTO ai_settings (client_id, is_enabled, prompt, model, updated_by)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (client_id) DO UPDATE
        SET is_enabled = EXCLUDED.is_enabled,
            prompt = EXCLUDED.prompt,
            model = EXCLUDED.model,
            updated_by = EXCLUDED.updated_by,
            updated_at = NOW()
        RETURNING {}
        "#,
        AI_SETTING_COLUMNS
    ))
    .bind(client_id)
    .bind(req.is_enabled)
    .bind(clean_text(req.prompt))
    .bind(&model)
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(client_id = %client_id, is_enabled = setting.is_enabled, "AI setting saved");
    Ok(Json(setting))
}

/// Set the flag; repeating the same value reports `changed: false`
pub async fn toggle(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult<Json<ToggleResponse>> {
    ensure_client(&state, client_id).await?;

    let mut tx = state.pool.begin().await?;
    let stored: Option<bool> =
        sqlx::query_scalar("SELECT is_enabled FROM ai_settings WHERE client_id = $1 FOR UPDATE")
            .bind(client_id)
            .fetch_optional(&mut *tx)
            .await?;

    let outcome = apply_ai_toggle(stored, req.is_enabled);
    if outcome.changed {
        sqlx::query(
            r#"
            INSERT INTO ai_settings (client_id, is_enabled, updated_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (client_id) DO UPDATE
            SET is_enabled = EXCLUDED.is_enabled,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            "#,
        )
        .bind(client_id)
        .bind(outcome.is_enabled)
        .bind(auth_user.user_id)
        .execute(&mut *tx)
        .await?;
        tracing::info!(client_id = %client_id, is_enabled = outcome.is_enabled, "AI auto-reply toggled");
    }
    tx.commit().await?;

    Ok(Json(ToggleResponse {
        client_id,
        is_enabled: outcome.is_enabled,
        changed: outcome.changed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_setting_is_disabled() {
        let id = Uuid::new_v4();
        let setting = AiSetting::disabled(id);
        assert!(!setting.is_enabled);
        let json = serde_json::to_value(&setting).unwrap();
        assert_eq!(json["client_id"], id.to_string());
        assert!(json["updated_at"].is_null());
    }

    #[test]
    fn test_validate_model() {
        assert_eq!(validate_model(Some(" gpt-4o-mini ".into())).unwrap(), Some("gpt-4o-mini".into()));
        assert_eq!(validate_model(Some("".into())).unwrap(), None);
        assert!(validate_model(Some("m".repeat(MODEL_MAX_CHARS + 1))).is_err());
    }
}
