//! Inbound provider webhooks: Meta (WhatsApp, Instagram), Telegram, OnlinePBX
//!
//! These routes are public; each provider is authenticated by its own
//! signature or shared secret before the body is parsed.

use axum::{
    body::Bytes,
    extract::{FromRequest, Query, Request, State},
    http::{header, HeaderMap},
    Form, Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::check_rate_limit;
use crate::{
    channels::{
        instagram::{self, InstagramWebhook},
        signature::{token_matches, verify_meta_signature},
        telegram::{self, TelegramUpdate},
        whatsapp::{self, WebhookVerifyQuery, WhatsAppWebhook},
        InboundMessage,
    },
    error::{ApiError, ApiResult},
    pbx::PbxEvent,
    services::{
        calls::{self, CallRow},
        inbox::{self, IngestOutcome},
    },
    state::AppState,
};

const META_SIGNATURE_HEADER: &str = "x-hub-signature-256";
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const PBX_TOKEN_HEADER: &str = "x-pbx-token";

#[derive(Debug, Default, Serialize)]
pub struct WebhookAck {
    pub received: usize,
    pub stored: usize,
    pub duplicates: usize,
}

// =============================================================================
// Helpers
// =============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Check the Meta HMAC signature. Without an app secret configured the check
/// is skipped so local setups can post sample payloads.
fn verify_meta(state: &AppState, headers: &HeaderMap, body: &[u8], source: &str) -> ApiResult<()> {
    let secret = &state.config.meta_app_secret;
    if secret.is_empty() {
        tracing::warn!(source = source, "META_APP_SECRET not set, webhook signature not checked");
        return Ok(());
    }
    if verify_meta_signature(secret, body, header_str(headers, META_SIGNATURE_HEADER)) {
        Ok(())
    } else {
        tracing::warn!(source = source, "Webhook signature mismatch");
        Err(ApiError::Unauthorized)
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8], source: &str) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(source = source, error = %e, "Malformed webhook payload");
        ApiError::BadRequest(format!("Malformed {} payload", source))
    })
}

/// Store every message. Database errors propagate so the provider retries;
/// redeliveries are absorbed by deduplication.
async fn ingest_all(state: &AppState, messages: Vec<InboundMessage>) -> ApiResult<WebhookAck> {
    let mut ack = WebhookAck {
        received: messages.len(),
        ..Default::default()
    };

    for message in messages {
        match inbox::ingest_inbound(state, message).await? {
            IngestOutcome::Stored(_) => ack.stored += 1,
            IngestOutcome::Duplicate => ack.duplicates += 1,
        }
    }

    Ok(ack)
}

fn verify_subscription(state: &AppState, query: &WebhookVerifyQuery, source: &str) -> ApiResult<String> {
    match query.accept(&state.config.meta_verify_token) {
        Some(challenge) => {
            tracing::info!(source = source, "Webhook subscription verified");
            Ok(challenge)
        }
        None => {
            tracing::warn!(source = source, "Webhook subscription rejected");
            Err(ApiError::Forbidden)
        }
    }
}

// =============================================================================
// Meta: WhatsApp and Instagram
// =============================================================================

/// Meta subscription handshake: echo `hub.challenge` when the token matches
pub async fn whatsapp_verify(
    State(state): State<AppState>,
    Query(query): Query<WebhookVerifyQuery>,
) -> ApiResult<String> {
    verify_subscription(&state, &query, "whatsapp")
}

pub async fn whatsapp_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    check_rate_limit(state.rate_limiter.check_webhook("whatsapp").await, "webhook")?;
    verify_meta(&state, &headers, &body, "whatsapp")?;

    let payload: WhatsAppWebhook = parse_json(&body, "whatsapp")?;
    let ack = ingest_all(&state, whatsapp::parse_webhook(&payload)).await?;

    tracing::debug!(received = ack.received, stored = ack.stored, "WhatsApp webhook processed");
    Ok(Json(ack))
}

pub async fn instagram_verify(
    State(state): State<AppState>,
    Query(query): Query<WebhookVerifyQuery>,
) -> ApiResult<String> {
    verify_subscription(&state, &query, "instagram")
}

pub async fn instagram_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    check_rate_limit(state.rate_limiter.check_webhook("instagram").await, "webhook")?;
    verify_meta(&state, &headers, &body, "instagram")?;

    let payload: InstagramWebhook = parse_json(&body, "instagram")?;
    let ack = ingest_all(&state, instagram::parse_webhook(&payload)).await?;

    tracing::debug!(received = ack.received, stored = ack.stored, "Instagram webhook processed");
    Ok(Json(ack))
}

// =============================================================================
// Telegram
// =============================================================================

pub async fn telegram_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    check_rate_limit(state.rate_limiter.check_webhook("telegram").await, "webhook")?;

    let secret = &state.config.telegram_webhook_secret;
    if secret.is_empty() {
        tracing::warn!("TELEGRAM_WEBHOOK_SECRET not set, update not authenticated");
    } else if !token_matches(secret, header_str(&headers, TELEGRAM_SECRET_HEADER)) {
        tracing::warn!("Telegram webhook secret mismatch");
        return Err(ApiError::Unauthorized);
    }

    let update: TelegramUpdate = parse_json(&body, "telegram")?;
    let messages: Vec<InboundMessage> = telegram::parse_update(&update).into_iter().collect();
    Ok(Json(ingest_all(&state, messages).await?))
}

// =============================================================================
// OnlinePBX
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PbxTokenQuery {
    pub token: Option<String>,
}

/// OnlinePBX call event, posted as JSON or as a form
pub async fn pbx_event(
    State(state): State<AppState>,
    Query(query): Query<PbxTokenQuery>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<CallRow>> {
    check_rate_limit(state.rate_limiter.check_webhook("pbx").await, "webhook")?;

    let provided = header_str(&headers, PBX_TOKEN_HEADER).or(query.token.as_deref());
    if !token_matches(&state.config.pbx_webhook_token, provided) {
        tracing::warn!("PBX webhook token mismatch or PBX_WEBHOOK_TOKEN unset");
        return Err(ApiError::Unauthorized);
    }

    let is_form = header_str(&headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let event: PbxEvent = if is_form {
        Form::<PbxEvent>::from_request(request, &())
            .await
            .map(|Form(event)| event)
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
    } else {
        Json::<PbxEvent>::from_request(request, &())
            .await
            .map(|Json(event)| event)
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
    };

    let payload = serde_json::to_value(&event).map_err(|_| ApiError::Internal)?;
    let call = calls::record_event(&state.pool, &event, payload).await?;
    Ok(Json(call))
}
