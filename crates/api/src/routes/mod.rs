//! API routes

pub mod ai;
pub mod auth;
pub mod calls;
pub mod clients;
pub mod comments;
pub mod funnels;
pub mod health;
pub mod lines;
pub mod media;
pub mod messages;
pub mod notifications;
pub mod quick_replies;
pub mod reports;
pub mod roles;
pub mod tasks;
pub mod tickets;
pub mod users;
pub mod waba;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderMap,
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};
use linedesk_shared::{RateLimitError, RateLimitResult};
use serde::Serialize;

use crate::{
    auth::require_auth,
    error::{ApiError, ApiResult},
    state::AppState,
    websocket::ws_handler,
};

/// Generic `{ "message": ... }` body for actions without a resource to return
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Distinguish an absent field from an explicit `null` in PATCH bodies
pub(crate) mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Extract client IP address from request headers.
/// Checks common proxy headers in order of preference.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Turn a limiter answer into a request outcome. Redis being unreachable
/// never blocks traffic.
pub fn check_rate_limit(
    result: Result<RateLimitResult, RateLimitError>,
    scope: &str,
) -> ApiResult<()> {
    match result {
        Ok(r) if r.allowed => Ok(()),
        Ok(r) => {
            tracing::warn!(scope = scope, retry_after = ?r.retry_after_seconds, "Rate limit exceeded");
            Err(ApiError::TooManyRequests(format!(
                "Too many {} attempts, retry in {} seconds",
                scope,
                r.retry_after_seconds.unwrap_or(60)
            )))
        }
        Err(e) => {
            tracing::warn!(scope = scope, error = %e, "Rate limiter unavailable, allowing request");
            Ok(())
        }
    }
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes: login and provider webhooks (authenticated by signature/secret)
    let public_api_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route(
            "/webhooks/whatsapp",
            get(webhooks::whatsapp_verify).post(webhooks::whatsapp_event),
        )
        .route(
            "/webhooks/instagram",
            get(webhooks::instagram_verify).post(webhooks::instagram_event),
        )
        .route("/webhooks/telegram", post(webhooks::telegram_update))
        .route("/webhooks/pbx", post(webhooks::pbx_event));

    // Protected API routes (auth required)
    let protected_api_routes = Router::new()
        // Auth
        .route("/auth/me", get(auth::me))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/change-password", post(auth::change_password))
        // Roles
        .route("/roles", get(roles::list_roles).post(roles::create_role))
        .route("/roles/:role_id", delete(roles::delete_role))
        // Users
        .route("/users", get(users::list_users).post(users::create_user))
        .route("/users/me/status", put(users::update_my_status))
        .route(
            "/users/:user_id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        // Lines
        .route("/lines", get(lines::list_lines).post(lines::create_line))
        .route(
            "/lines/:line_id",
            get(lines::get_line)
                .patch(lines::update_line)
                .delete(lines::delete_line),
        )
        .route("/lines/:line_id/operators", get(lines::line_operators))
        // Clients
        .route("/clients", get(clients::list_clients).post(clients::create_client))
        .route(
            "/clients/:client_id",
            get(clients::get_client)
                .patch(clients::update_client)
                .delete(clients::delete_client),
        )
        .route("/clients/:client_id/tickets", get(clients::client_tickets))
        .route("/clients/:client_id/calls", get(clients::client_calls))
        // Messages
        .route(
            "/clients/:client_id/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/clients/:client_id/messages/read", post(messages::mark_read))
        .route("/messages/unread", get(messages::unread_counts))
        // Tickets
        .route("/tickets", get(tickets::list_tickets).post(tickets::create_ticket))
        .route(
            "/tickets/:ticket_id",
            get(tickets::get_ticket)
                .patch(tickets::update_ticket)
                .delete(tickets::delete_ticket),
        )
        .route("/tickets/:ticket_id/status", post(tickets::change_status))
        .route("/tickets/:ticket_id/transfer", post(tickets::transfer_ticket))
        .route("/tickets/:ticket_id/transfers", get(tickets::list_transfers))
        .route("/tickets/:ticket_id/stage", post(tickets::move_to_stage))
        .route(
            "/tickets/:ticket_id/comments",
            get(comments::list_ticket_comments).post(comments::add_ticket_comment),
        )
        // Calls
        .route("/calls", get(calls::list_calls))
        .route("/calls/:call_id", get(calls::get_call))
        // Tasks
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/tasks/:task_id",
            get(tasks::get_task)
                .patch(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/tasks/:task_id/status", post(tasks::change_status))
        .route(
            "/tasks/:task_id/comments",
            get(comments::list_task_comments).post(comments::add_task_comment),
        )
        // Comments
        .route(
            "/comments/:comment_id",
            patch(comments::update_comment).delete(comments::delete_comment),
        )
        // Quick replies
        .route(
            "/quick-replies",
            get(quick_replies::list_quick_replies).post(quick_replies::create_quick_reply),
        )
        .route(
            "/quick-replies/:reply_id",
            patch(quick_replies::update_quick_reply).delete(quick_replies::delete_quick_reply),
        )
        .route("/quick-replies/:reply_id/use", post(quick_replies::use_quick_reply))
        // Media
        .route("/media", post(media::upload))
        .route("/media/:media_id", get(media::get_media).delete(media::delete_media))
        .route("/media/:media_id/content", get(media::download))
        // AI agent settings
        .route("/ai/settings", get(ai::list_enabled))
        .route(
            "/ai/settings/:client_id",
            get(ai::get_setting).put(ai::put_setting),
        )
        .route("/ai/settings/:client_id/toggle", post(ai::toggle))
        // Funnels
        .route("/funnels", get(funnels::list_funnels).post(funnels::create_funnel))
        .route(
            "/funnels/:funnel_id",
            get(funnels::get_funnel)
                .patch(funnels::update_funnel)
                .delete(funnels::delete_funnel),
        )
        .route("/funnels/:funnel_id/stages", post(funnels::create_stage))
        .route("/funnels/:funnel_id/stages/order", put(funnels::reorder_stages))
        .route(
            "/funnels/:funnel_id/stages/:stage_id",
            patch(funnels::update_stage).delete(funnels::delete_stage),
        )
        // WABA
        .route(
            "/waba/templates",
            get(waba::list_templates).post(waba::create_template),
        )
        .route("/waba/templates/sync", post(waba::sync_templates))
        .route(
            "/waba/templates/:template_id",
            delete(waba::delete_template),
        )
        .route(
            "/waba/campaigns",
            get(waba::list_campaigns).post(waba::create_campaign),
        )
        .route("/waba/campaigns/:campaign_id", get(waba::get_campaign))
        .route("/waba/campaigns/:campaign_id/launch", post(waba::launch_campaign))
        .route("/waba/campaigns/:campaign_id/cancel", post(waba::cancel_campaign))
        // Reports
        .route("/reports/:report_type", get(reports::generate_report))
        .route(
            "/scheduled-reports",
            get(reports::list_scheduled).post(reports::create_scheduled),
        )
        .route(
            "/scheduled-reports/:report_id",
            get(reports::get_scheduled)
                .patch(reports::update_scheduled)
                .delete(reports::delete_scheduled),
        )
        .route("/scheduled-reports/:report_id/runs", get(reports::list_runs))
        .route("/scheduled-reports/:report_id/run", post(reports::run_now))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/:notification_id/read", post(notifications::mark_read))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    // WebSocket authenticates from the query string
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes)
        .merge(websocket_routes);

    // Uploads carry their own limit; everything else stays small
    let body_limit = state.config.media_max_bytes.max(1024 * 1024) + 64 * 1024;

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_client_ip_prefers_proxy_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("10.0.0.1"));

        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_rate_limit_outcomes() {
        assert!(check_rate_limit(Ok(RateLimitResult::unlimited()), "login").is_ok());
        assert!(check_rate_limit(Ok(RateLimitResult::from_count(3, 5, 60)), "login").is_ok());

        let blocked = check_rate_limit(Ok(RateLimitResult::from_count(6, 5, 42)), "login");
        match blocked {
            Err(ApiError::TooManyRequests(msg)) => assert!(msg.contains("42")),
            other => panic!("expected TooManyRequests, got {:?}", other),
        }
    }
}
