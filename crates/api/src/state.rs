//! Shared application state

use std::sync::Arc;

use linedesk_shared::RateLimiter;
use sqlx::PgPool;

use crate::ai_agent::AiAgentClient;
use crate::auth::{AuthState, JwtManager};
use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::email::ReportMailer;
use crate::websocket::WebSocketState;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub rate_limiter: RateLimiter,
    pub ws_state: WebSocketState,
    pub channels: ChannelRegistry,
    pub ai_agent: AiAgentClient,
    pub mailer: ReportMailer,
}

impl AppState {
    /// Wire the outbound clients from configuration
    pub fn new(pool: PgPool, config: Config, rate_limiter: RateLimiter) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let channels = ChannelRegistry::from_config(&config);
        let ai_agent = AiAgentClient::from_config(&config);
        let mailer = ReportMailer::from_config(&config);

        Self {
            pool,
            config: Arc::new(config),
            jwt_manager,
            rate_limiter,
            ws_state: WebSocketState::new(),
            channels,
            ai_agent,
            mailer,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }
}
