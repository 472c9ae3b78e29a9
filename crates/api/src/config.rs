//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,
    pub cors_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub rate_limit_login_per_minute: u32,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Media storage
    pub media_dir: String,
    pub media_max_bytes: usize,

    // Meta Graph API (WhatsApp Cloud, WABA, Instagram)
    pub graph_api_base: String,
    pub whatsapp_token: String,
    pub whatsapp_phone_number_id: String,
    pub waba_account_id: String,
    pub meta_app_secret: String,
    pub meta_verify_token: String,
    pub instagram_token: String,
    pub instagram_page_id: String,

    // Telegram
    pub telegram_api_base: String,
    pub telegram_bot_token: String,
    pub telegram_webhook_secret: String,

    // OnlinePBX
    pub pbx_webhook_token: String,

    // AI agent (OpenAI-compatible)
    pub ai_agent_url: String,
    pub ai_agent_api_key: String,
    pub ai_agent_model: String,

    // Email
    pub resend_api_key: String,
    pub email_from: String,

    // Feature flags
    pub enable_ai_autoreply: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Redis
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            rate_limit_login_per_minute: env::var("RATE_LIMIT_LOGIN_PER_MINUTE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            jwt_expiry_hours: env::var("JWT_EXPIRY_HOURS")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .unwrap_or(12),

            // Media storage
            media_dir: env::var("MEDIA_DIR").unwrap_or_else(|_| "./media".to_string()),
            media_max_bytes: env::var("MEDIA_MAX_BYTES")
                .unwrap_or_else(|_| "26214400".to_string()) // 25MB
                .parse()
                .unwrap_or(26_214_400),

            // Meta Graph API
            graph_api_base: env::var("GRAPH_API_BASE")
                .unwrap_or_else(|_| "https://graph.facebook.com/v19.0".to_string()),
            whatsapp_token: env::var("WHATSAPP_TOKEN").unwrap_or_default(),
            whatsapp_phone_number_id: env::var("WHATSAPP_PHONE_NUMBER_ID").unwrap_or_default(),
            waba_account_id: env::var("WABA_ACCOUNT_ID").unwrap_or_default(),
            meta_app_secret: env::var("META_APP_SECRET").unwrap_or_default(),
            meta_verify_token: env::var("META_VERIFY_TOKEN").unwrap_or_default(),
            instagram_token: env::var("INSTAGRAM_TOKEN").unwrap_or_default(),
            instagram_page_id: env::var("INSTAGRAM_PAGE_ID").unwrap_or_default(),

            // Telegram
            telegram_api_base: env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            telegram_webhook_secret: env::var("TELEGRAM_WEBHOOK_SECRET").unwrap_or_default(),

            // OnlinePBX
            pbx_webhook_token: env::var("PBX_WEBHOOK_TOKEN").unwrap_or_default(),

            // AI agent
            ai_agent_url: env::var("AI_AGENT_URL").unwrap_or_default(),
            ai_agent_api_key: env::var("AI_AGENT_API_KEY").unwrap_or_default(),
            ai_agent_model: env::var("AI_AGENT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),

            // Email
            resend_api_key: env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "LineDesk <reports@localhost>".to_string()),

            // Feature flags
            enable_ai_autoreply: env::var("ENABLE_AI_AUTOREPLY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }

    /// AI auto-reply runs only when the flag is on and an agent URL is set
    pub fn ai_autoreply_enabled(&self) -> bool {
        self.enable_ai_autoreply && !self.ai_agent_url.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to set required env vars for testing
    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
    }

    /// Helper to clear env vars after tests
    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_SECRET");
        env::remove_var("CORS_ORIGINS");
        env::remove_var("ENABLE_AI_AUTOREPLY");
        env::remove_var("AI_AGENT_URL");
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        cleanup_config();
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_jwt_secret() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("JWT_SECRET"))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_jwt_secret_rejected() {
        setup_minimal_config();
        env::set_var("JWT_SECRET", "short");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_defaults_and_cors_list() {
        setup_minimal_config();
        env::set_var("CORS_ORIGINS", "https://crm.example.com, https://ops.example.com,");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert_eq!(config.rate_limit_login_per_minute, 10);
        assert_eq!(
            config.cors_origins,
            vec!["https://crm.example.com", "https://ops.example.com"]
        );
        assert_eq!(config.telegram_api_base, "https://api.telegram.org");

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_ai_autoreply_requires_agent_url() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert!(config.enable_ai_autoreply);
        assert!(!config.ai_autoreply_enabled());

        env::set_var("AI_AGENT_URL", "http://localhost:8000/v1");
        let config = Config::from_env().unwrap();
        assert!(config.ai_autoreply_enabled());

        env::set_var("ENABLE_AI_AUTOREPLY", "false");
        let config = Config::from_env().unwrap();
        assert!(!config.ai_autoreply_enabled());

        cleanup_config();
    }
}
