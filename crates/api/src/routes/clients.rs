//! Client records

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use linedesk_shared::{workflow::normalize_phone, PageParams, PaginatedResponse};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{double_option, MessageResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    services::{
        calls::{CallRow, CALL_COLUMNS},
        tickets::{TicketRow, TICKET_COLUMNS},
    },
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub whatsapp_phone: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_username: Option<String>,
    pub instagram_id: Option<String>,
    pub instagram_username: Option<String>,
    pub company: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub assigned_to: Option<Uuid>,
}

/// `null` clears a field, an absent field keeps it
#[derive(Debug, Default, Deserialize)]
pub struct UpdateClientRequest {
    pub full_name: Option<String>,
    #[serde(default, with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub whatsapp_phone: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub telegram_chat_id: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub telegram_username: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub instagram_id: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub instagram_username: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub company: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub notes: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    pub assigned_to: Option<Option<Uuid>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientFilter {
    /// Matches name, phones, e-mail, usernames and company
    pub q: Option<String>,
    pub tag: Option<String>,
    pub assigned_to: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ClientResponse {
    pub id: Uuid,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub whatsapp_phone: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_username: Option<String>,
    pub instagram_id: Option<String>,
    pub instagram_username: Option<String>,
    pub company: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub assigned_to: Option<Uuid>,
    pub unread_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const CLIENT_SELECT: &str = r#"
    SELECT c.id, c.full_name, c.phone, c.email, c.whatsapp_phone, c.telegram_chat_id,
           c.telegram_username, c.instagram_id, c.instagram_username, c.company, c.notes,
           c.tags, c.assigned_to,
           (SELECT COUNT(*) FROM messages m
            WHERE m.client_id = c.id AND m.direction = 'inbound' AND NOT m.is_read) AS unread_count,
           (SELECT MAX(m.created_at) FROM messages m WHERE m.client_id = c.id) AS last_message_at,
           c.created_at, c.updated_at
    FROM clients c
"#;

/// Contact fields after trimming and phone normalization
#[derive(Debug, Default, PartialEq)]
struct ClientFields {
    full_name: String,
    phone: Option<String>,
    email: Option<String>,
    whatsapp_phone: Option<String>,
    telegram_chat_id: Option<String>,
    telegram_username: Option<String>,
    instagram_id: Option<String>,
    instagram_username: Option<String>,
    company: Option<String>,
    notes: Option<String>,
    tags: Vec<String>,
    assigned_to: Option<Uuid>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clean_phone(value: Option<String>) -> Option<String> {
    value.map(|v| normalize_phone(&v)).filter(|v| !v.is_empty())
}

fn clean_username(value: Option<String>) -> Option<String> {
    clean(value).map(|v| v.trim_start_matches('@').to_string())
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

impl ClientFields {
    fn validate(mut self) -> ApiResult<Self> {
        self.full_name = self.full_name.trim().to_string();
        if self.full_name.is_empty() || self.full_name.chars().count() > 255 {
            return Err(ApiError::Validation("Client name must be 1-255 characters".into()));
        }
        if self.email.as_deref().is_some_and(|e| !e.contains('@')) {
            return Err(ApiError::Validation("Invalid email address".into()));
        }
        Ok(self)
    }

    fn from_create(req: CreateClientRequest) -> Self {
        Self {
            full_name: req.full_name,
            phone: clean_phone(req.phone),
            email: clean(req.email).map(|e| e.to_lowercase()),
            whatsapp_phone: clean_phone(req.whatsapp_phone),
            telegram_chat_id: clean(req.telegram_chat_id),
            telegram_username: clean_username(req.telegram_username),
            instagram_id: clean(req.instagram_id),
            instagram_username: clean_username(req.instagram_username),
            company: clean(req.company),
            notes: clean(req.notes),
            tags: clean_tags(req.tags),
            assigned_to: req.assigned_to,
        }
    }

    fn merge(current: ClientResponse, req: UpdateClientRequest) -> Self {
        fn pick(patch: Option<Option<String>>, current: Option<String>) -> Option<String> {
            match patch {
                Some(value) => value,
                None => current,
            }
        }

        Self {
            full_name: req.full_name.unwrap_or(current.full_name),
            phone: clean_phone(pick(req.phone, current.phone)),
            email: clean(pick(req.email, current.email)).map(|e| e.to_lowercase()),
            whatsapp_phone: clean_phone(pick(req.whatsapp_phone, current.whatsapp_phone)),
            telegram_chat_id: clean(pick(req.telegram_chat_id, current.telegram_chat_id)),
            telegram_username: clean_username(pick(req.telegram_username, current.telegram_username)),
            instagram_id: clean(pick(req.instagram_id, current.instagram_id)),
            instagram_username: clean_username(pick(
                req.instagram_username,
                current.instagram_username,
            )),
            company: clean(pick(req.company, current.company)),
            notes: clean(pick(req.notes, current.notes)),
            tags: clean_tags(req.tags.unwrap_or(current.tags)),
            assigned_to: req.assigned_to.unwrap_or(current.assigned_to),
        }
    }
}

async fn fetch_client(state: &AppState, client_id: Uuid) -> ApiResult<ClientResponse> {
    sqlx::query_as::<_, ClientResponse>(&format!(
        "{} WHERE c.id = $1 AND c.deleted_at IS NULL",
        CLIENT_SELECT
    ))
    .bind(client_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound)
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

// =============================================================================
// Handlers
// =============================================================================

/// Search clients, most recent conversation first
pub async fn list_clients(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Query(filter): Query<ClientFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PaginatedResponse<ClientResponse>>> {
    let pattern = filter
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")));
    let tag = filter.tag.map(|t| t.trim().to_lowercase());

    const WHERE: &str = r#"
        WHERE c.deleted_at IS NULL
          AND ($1::text IS NULL
               OR c.full_name ILIKE $1 OR c.phone ILIKE $1 OR c.whatsapp_phone ILIKE $1
               OR c.email ILIKE $1 OR c.telegram_username ILIKE $1
               OR c.instagram_username ILIKE $1 OR c.company ILIKE $1)
          AND ($2::text IS NULL OR $2 = ANY(c.tags))
          AND ($3::uuid IS NULL OR c.assigned_to = $3)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM clients c {}", WHERE))
        .bind(&pattern)
        .bind(&tag)
        .bind(filter.assigned_to)
        .fetch_one(&state.pool)
        .await?;

    let clients = sqlx::query_as::<_, ClientResponse>(&format!(
        "{} {} ORDER BY last_message_at DESC NULLS LAST, c.created_at DESC LIMIT $4 OFFSET $5",
        CLIENT_SELECT, WHERE
    ))
    .bind(&pattern)
    .bind(&tag)
    .bind(filter.assigned_to)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(PaginatedResponse::from_params(clients, total, &page)))
}

pub async fn create_client(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateClientRequest>,
) -> ApiResult<Json<ClientResponse>> {
    let fields = ClientFields::from_create(req).validate()?;

    let client_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO clients (full_name, phone, email, whatsapp_phone, telegram_chat_id,
                             telegram_username, instagram_id, instagram_username, company,
                             notes, tags, assigned_to)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING id
        "#,
    )
    .bind(&fields.full_name)
    .bind(&fields.phone)
    .bind(&fields.email)
    .bind(&fields.whatsapp_phone)
    .bind(&fields.telegram_chat_id)
    .bind(&fields.telegram_username)
    .bind(&fields.instagram_id)
    .bind(&fields.instagram_username)
    .bind(&fields.company)
    .bind(&fields.notes)
    .bind(&fields.tags)
    .bind(fields.assigned_to)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(client_id = %client_id, created_by = %auth_user.user_id, "Client created");
    Ok(Json(fetch_client(&state, client_id).await?))
}

pub async fn get_client(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<ClientResponse>> {
    Ok(Json(fetch_client(&state, client_id).await?))
}

pub async fn update_client(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<UpdateClientRequest>,
) -> ApiResult<Json<ClientResponse>> {
    let current = fetch_client(&state, client_id).await?;
    let fields = ClientFields::merge(current, req).validate()?;

    sqlx::query(
        r#"
        UPDATE clients
        SET full_name = $2, phone = $3, email = $4, whatsapp_phone = $5,
            telegram_chat_id = $6, telegram_username = $7, instagram_id = $8,
            instagram_username = $9, company = $10, notes = $11, tags = $12,
            assigned_to = $13, updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(client_id)
    .bind(&fields.full_name)
    .bind(&fields.phone)
    .bind(&fields.email)
    .bind(&fields.whatsapp_phone)
    .bind(&fields.telegram_chat_id)
    .bind(&fields.telegram_username)
    .bind(&fields.instagram_id)
    .bind(&fields.instagram_username)
    .bind(&fields.company)
    .bind(&fields.notes)
    .bind(&fields.tags)
    .bind(fields.assigned_to)
    .execute(&state.pool)
    .await?;

    tracing::info!(client_id = %client_id, updated_by = %auth_user.user_id, "Client updated");
    Ok(Json(fetch_client(&state, client_id).await?))
}

/// Soft delete. History stays; the channel identities become free again.
pub async fn delete_client(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    auth_user.require_supervisor()?;

    let deleted = sqlx::query(
        "UPDATE clients SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(client_id)
    .execute(&state.pool)
    .await?
    .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    tracing::info!(client_id = %client_id, deleted_by = %auth_user.user_id, "Client deleted");
    Ok(Json(MessageResponse::new("Client deleted")))
}

pub async fn client_tickets(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<Vec<TicketRow>>> {
    ensure_client(&state, client_id).await?;

    let tickets = sqlx::query_as::<_, TicketRow>(&format!(
        "SELECT {} FROM tickets WHERE tickets.client_id = $1 ORDER BY tickets.created_at DESC",
        TICKET_COLUMNS
    ))
    .bind(client_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(tickets))
}

pub async fn client_calls(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CallRow>>> {
    ensure_client(&state, client_id).await?;

    let calls = sqlx::query_as::<_, CallRow>(&format!(
        "SELECT {} FROM calls WHERE calls.client_id = $1 ORDER BY calls.started_at DESC",
        CALL_COLUMNS
    ))
    .bind(client_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(calls))
}
