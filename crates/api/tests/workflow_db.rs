//! Database-backed workflow tests
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`
#![allow(clippy::unwrap_used)]

mod common;

use axum::{extract::Path, Extension, Json};
use linedesk_api::{
    channels::WhatsAppClient,
    routes::{ai, quick_replies},
    services::{
        campaigns::{self, NewCampaign},
        presence,
        tickets::{self, NewTicket, TransferTarget},
    },
    ApiError,
};
use linedesk_shared::{CampaignStatus, UserStatus};
use mockito::Server;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use uuid::Uuid;

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_create_ticket_rejects_unknown_client() {
    let state = common::db_state().await;
    let line = common::create_line(&state.pool).await;
    let operator = common::create_user(&state.pool, "operator", Some(line), "online", 0).await;
    let actor = common::auth_user(&state, operator).await;

    let result = tickets::create_ticket(
        &state.pool,
        &state.ws_state,
        &actor,
        NewTicket {
            subject: "Не работает доставка".into(),
            client_id: Uuid::new_v4(),
            ..Default::default()
        },
    )
    .await;

    assert!(matches!(result, Err(ApiError::Validation(_))));
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_transfer_to_line_picks_online_operator() {
    let state = common::db_state().await;
    let pool = &state.pool;

    let line = common::create_line(pool).await;
    let supervisor = common::create_user(pool, "supervisor", None, "online", 0).await;
    let _offline = common::create_user(pool, "operator", Some(line), "offline", 0).await;
    let online = common::create_user(pool, "operator", Some(line), "online", 1).await;
    let client = common::create_client(pool).await;
    let actor = common::auth_user(&state, supervisor).await;

    let ticket = tickets::create_ticket(
        pool,
        &state.ws_state,
        &actor,
        NewTicket {
            subject: "Возврат товара".into(),
            client_id: client,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let outcome = tickets::transfer(
        pool,
        &state.ws_state,
        &actor,
        ticket.id,
        TransferTarget::Line(line),
        Some("Профильная линия".into()),
    )
    .await
    .unwrap();

    assert!(!outcome.queued);
    assert_eq!(outcome.ticket.assigned_to, Some(online));
    assert_eq!(outcome.ticket.line_id, Some(line));

    let history: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM transfer_history WHERE ticket_id = $1")
            .bind(ticket.id)
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(history, 1);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_transfer_to_line_without_operators_queues() {
    let state = common::db_state().await;
    let pool = &state.pool;

    let line = common::create_line(pool).await;
    let supervisor = common::create_user(pool, "supervisor", None, "online", 0).await;
    let _busy = common::create_user(pool, "operator", Some(line), "busy", 0).await;
    let client = common::create_client(pool).await;
    let actor = common::auth_user(&state, supervisor).await;

    let ticket = tickets::create_ticket(
        pool,
        &state.ws_state,
        &actor,
        NewTicket {
            subject: "Консультация".into(),
            client_id: client,
            assigned_to: Some(supervisor),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let outcome = tickets::transfer(
        pool,
        &state.ws_state,
        &actor,
        ticket.id,
        TransferTarget::Line(line),
        None,
    )
    .await
    .unwrap();

    assert!(outcome.queued);
    assert_eq!(outcome.ticket.assigned_to, None);
    assert_eq!(outcome.ticket.line_id, Some(line));
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_ai_toggle_is_idempotent() {
    let state = common::db_state().await;
    let supervisor = common::create_user(&state.pool, "supervisor", None, "online", 0).await;
    let client = common::create_client(&state.pool).await;
    let actor = common::auth_user(&state, supervisor).await;

    let toggle = |enabled: bool| {
        ai::toggle(
            axum::extract::State(state.clone()),
            Extension(actor.clone()),
            Path(client),
            Json(ai::ToggleRequest { is_enabled: enabled }),
        )
    };

    let Json(first) = toggle(true).await.unwrap();
    assert!(first.is_enabled);
    assert!(first.changed);

    let Json(second) = toggle(true).await.unwrap();
    assert!(second.is_enabled);
    assert!(!second.changed);

    let Json(third) = toggle(false).await.unwrap();
    assert!(!third.is_enabled);
    assert!(third.changed);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_quick_reply_use_counts_every_call() {
    let state = common::db_state().await;
    let operator = common::create_user(&state.pool, "operator", None, "online", 0).await;
    let actor = common::auth_user(&state, operator).await;

    let Json(created) = quick_replies::create_quick_reply(
        axum::extract::State(state.clone()),
        Extension(actor.clone()),
        Json(quick_replies::CreateQuickReplyRequest {
            title: "Приветствие".into(),
            content: "Здравствуйте! Чем можем помочь?".into(),
            category: Some("greeting".into()),
            media_file_id: None,
            is_shared: Some(false),
        }),
    )
    .await
    .unwrap();
    assert_eq!(created.usage_count, 0);

    for expected in 1..=3 {
        let Json(used) = quick_replies::use_quick_reply(
            axum::extract::State(state.clone()),
            Extension(actor.clone()),
            Path(created.id),
        )
        .await
        .unwrap();
        assert_eq!(used.reply.usage_count, expected);
    }
}

// =============================================================================
// Campaigns
// =============================================================================

const TEMPLATE_BODY: &str = "Здравствуйте, {{1}}! Скидка 10% до конца недели.";

fn whatsapp(url: &str) -> WhatsAppClient {
    WhatsAppClient::new(reqwest::Client::new(), url, "wa-token", "10001", "20002")
}

fn wamid_body(wamid: &str) -> String {
    json!({ "messages": [{ "id": wamid }] }).to_string()
}

async fn draft_campaign(
    state: &linedesk_api::AppState,
    template_status: &str,
    client_ids: Vec<Uuid>,
) -> Uuid {
    let supervisor = common::create_user(&state.pool, "supervisor", None, "online", 0).await;
    let actor = common::auth_user(state, supervisor).await;
    let template_id = common::create_template(&state.pool, template_status, TEMPLATE_BODY).await;

    campaigns::create_campaign(
        &state.pool,
        &actor,
        NewCampaign {
            name: "Осенняя акция".into(),
            template_id,
            variables: vec!["Анна".into()],
            client_ids,
            scheduled_at: None,
        },
    )
    .await
    .unwrap()
    .id
}

async fn pending_recipients(pool: &PgPool, campaign_id: Uuid) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM waba_campaign_recipients WHERE campaign_id = $1 AND status = 'pending'",
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_launch_requires_approved_template() {
    let state = common::db_state().await;
    let client = common::create_whatsapp_client(&state.pool, true).await;
    let campaign_id = draft_campaign(&state, "pending", vec![client]).await;

    let server = Server::new_async().await;
    let result = campaigns::launch(&state.pool, &whatsapp(&server.url()), campaign_id).await;

    assert!(matches!(result, Err(ApiError::Validation(_))));
    let campaign = campaigns::get_campaign(&state.pool, campaign_id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_launch_counts_recipients_without_phone_as_failed() {
    let state = common::db_state().await;
    let reachable = common::create_whatsapp_client(&state.pool, true).await;
    let no_phone = common::create_whatsapp_client(&state.pool, false).await;
    let campaign_id = draft_campaign(&state, "approved", vec![reachable, no_phone]).await;

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/10001/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(wamid_body(&format!("wamid.{}", Uuid::new_v4().simple())))
        .expect(1)
        .create_async()
        .await;
    let client = whatsapp(&server.url());

    let campaign = campaigns::launch(&state.pool, &client, campaign_id).await.unwrap();

    mock.assert_async().await;
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.total_recipients, 2);
    assert_eq!(campaign.sent_count, 1);
    assert_eq!(campaign.failed_count, 1);
    assert!(campaign.finished_at.is_some());

    let recipients = campaigns::recipients(&state.pool, campaign_id).await.unwrap();
    let missing = recipients.iter().find(|r| r.client_id == no_phone).unwrap();
    assert_eq!(missing.error.as_deref(), Some("Client has no WhatsApp phone"));

    // Only draft and scheduled campaigns launch
    let again = campaigns::launch(&state.pool, &client, campaign_id).await;
    assert!(matches!(again, Err(ApiError::Conflict(_))));
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_launch_fails_campaign_when_every_send_fails() {
    let state = common::db_state().await;
    let first = common::create_whatsapp_client(&state.pool, true).await;
    let second = common::create_whatsapp_client(&state.pool, true).await;
    let campaign_id = draft_campaign(&state, "approved", vec![first, second]).await;

    let mut server = Server::new_async().await;
    server
        .mock("POST", "/10001/messages")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(json!({ "error": { "message": "Recipient not on WhatsApp" } }).to_string())
        .create_async()
        .await;

    let campaign = campaigns::launch(&state.pool, &whatsapp(&server.url()), campaign_id)
        .await
        .unwrap();

    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(campaign.sent_count, 0);
    assert_eq!(campaign.failed_count, 2);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_launch_finishes_when_a_sent_message_cannot_be_recorded() {
    let state = common::db_state().await;
    let first = common::create_whatsapp_client(&state.pool, true).await;
    let second = common::create_whatsapp_client(&state.pool, true).await;
    let campaign_id = draft_campaign(&state, "approved", vec![first, second]).await;

    // The provider repeats one message id; the second insert hits the unique index
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/10001/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(wamid_body(&format!("wamid.{}", Uuid::new_v4().simple())))
        .expect(2)
        .create_async()
        .await;

    let campaign = campaigns::launch(&state.pool, &whatsapp(&server.url()), campaign_id)
        .await
        .unwrap();

    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.sent_count, 1);
    assert_eq!(campaign.failed_count, 1);
    assert_eq!(pending_recipients(&state.pool, campaign_id).await, 0);
}

// --- presence ---

async fn stored_status(pool: &PgPool, user_id: Uuid) -> UserStatus {
    sqlx::query_scalar("SELECT status FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_connect_keeps_busy_operator_busy() {
    let state = common::db_state().await;
    let line = common::create_line(&state.pool).await;
    let busy = common::create_user(&state.pool, "operator", Some(line), "busy", 1).await;

    let status = presence::mark_connected(&state.pool, &state.ws_state, busy)
        .await
        .unwrap();
    assert_eq!(status, UserStatus::Busy);
    assert_eq!(stored_status(&state.pool, busy).await, UserStatus::Busy);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_connect_brings_offline_operator_online() {
    let state = common::db_state().await;
    let line = common::create_line(&state.pool).await;
    let offline = common::create_user(&state.pool, "operator", Some(line), "offline", 1).await;

    let status = presence::mark_connected(&state.pool, &state.ws_state, offline)
        .await
        .unwrap();
    assert_eq!(status, UserStatus::Online);
    assert_eq!(stored_status(&state.pool, offline).await, UserStatus::Online);
}
