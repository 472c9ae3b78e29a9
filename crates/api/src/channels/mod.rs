//! Outbound messaging channel clients
//!
//! Each external messenger (WhatsApp Cloud API, Telegram Bot API, Instagram
//! Messaging) implements [`ChannelSender`]. Inbound webhook payloads are
//! parsed into [`InboundMessage`] by the channel's `parse_*` functions.
//!
//! Transient HTTP failures (timeouts, connection errors, 429 and 5xx) are
//! retried with exponential backoff and jitter; permanent failures return
//! immediately.

pub mod instagram;
pub mod signature;
pub mod telegram;
pub mod whatsapp;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linedesk_shared::Channel;
use time::OffsetDateTime;

pub use instagram::InstagramClient;
pub use telegram::TelegramClient;
pub use whatsapp::WhatsAppClient;

use crate::config::Config;

/// Retries after the first attempt (3 attempts in total)
const MAX_RETRIES: usize = 2;

/// Upper bound for a single backoff delay
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{0} channel is not configured")]
    NotConfigured(Channel),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{channel} API returned {status}: {body}")]
    Api {
        channel: Channel,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {0} API")]
    InvalidResponse(Channel),

    #[error("{0}")]
    Rejected(String),
}

impl ChannelError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ChannelError::Api { status, .. } => *status == 429 || *status >= 500,
            ChannelError::NotConfigured(_)
            | ChannelError::InvalidResponse(_)
            | ChannelError::Rejected(_) => false,
        }
    }
}

/// Identifier assigned by the provider to a sent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub external_id: String,
}

/// File attached to an outbound message
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutboundMedia {
    /// Coarse media kind as understood by the messenger APIs
    pub fn kind(&self) -> &'static str {
        match self.mime_type.split('/').next().unwrap_or_default() {
            "image" => "image",
            "video" => "video",
            "audio" => "audio",
            _ => "document",
        }
    }
}

/// Message received from a channel webhook, normalized across channels
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: Channel,
    /// Channel identity of the sender (WhatsApp phone, Telegram chat id, Instagram user id)
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub external_id: String,
    pub content: String,
    pub received_at: OffsetDateTime,
}

/// Common interface of the outbound messenger clients
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    fn is_configured(&self) -> bool;

    async fn send_text(&self, recipient: &str, text: &str) -> Result<SentMessage, ChannelError>;

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<SentMessage, ChannelError>;
}

/// All configured channel clients
#[derive(Clone)]
pub struct ChannelRegistry {
    pub whatsapp: Arc<WhatsAppClient>,
    pub telegram: Arc<TelegramClient>,
    pub instagram: Arc<InstagramClient>,
}

impl ChannelRegistry {
    pub fn from_config(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            whatsapp: Arc::new(WhatsAppClient::new(
                http.clone(),
                &config.graph_api_base,
                &config.whatsapp_token,
                &config.whatsapp_phone_number_id,
                &config.waba_account_id,
            )),
            telegram: Arc::new(TelegramClient::new(
                http.clone(),
                &config.telegram_api_base,
                &config.telegram_bot_token,
            )),
            instagram: Arc::new(InstagramClient::new(
                http,
                &config.graph_api_base,
                &config.instagram_token,
                &config.instagram_page_id,
            )),
        }
    }

    pub fn sender(&self, channel: Channel) -> Arc<dyn ChannelSender> {
        match channel {
            Channel::Whatsapp => self.whatsapp.clone(),
            Channel::Telegram => self.telegram.clone(),
            Channel::Instagram => self.instagram.clone(),
        }
    }
}

/// Run `op` with exponential backoff, retrying only transient failures
pub(crate) async fn with_retry<T, F, Fut>(channel: Channel, mut op: F) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    use tokio_retry::strategy::{jitter, ExponentialBackoff};
    use tokio_retry::Retry;

    // 100ms, 200ms before jitter
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor(50)
        .max_delay(RETRY_MAX_DELAY)
        .take(MAX_RETRIES)
        .map(jitter);

    Retry::spawn(retry_strategy, || {
        let attempt = op();
        async move {
            match attempt.await {
                Ok(value) => Ok(Ok(value)),
                Err(e) if e.is_transient() => {
                    tracing::debug!(channel = %channel, error = %e, "Transient error - will retry");
                    Err(Err(e))
                }
                Err(e) => {
                    tracing::debug!(channel = %channel, error = %e, "Permanent error - will not retry");
                    Ok(Err(e))
                }
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

/// Turn a non-2xx response into [`ChannelError::Api`] and parse the JSON body
pub(crate) async fn read_json(
    channel: Channel,
    response: reqwest::Response,
) -> Result<serde_json::Value, ChannelError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ChannelError::Api {
            channel,
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|_| ChannelError::InvalidResponse(channel))
}

/// Convert a Unix timestamp string from a webhook payload
pub(crate) fn timestamp_or_now(unix: Option<i64>) -> OffsetDateTime {
    unix.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn api_error(status: u16) -> ChannelError {
        ChannelError::Api {
            channel: Channel::Whatsapp,
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(api_error(500).is_transient());
        assert!(api_error(503).is_transient());
        assert!(api_error(429).is_transient());
        assert!(!api_error(400).is_transient());
        assert!(!api_error(401).is_transient());
        assert!(!ChannelError::NotConfigured(Channel::Telegram).is_transient());
        assert!(!ChannelError::InvalidResponse(Channel::Instagram).is_transient());
    }

    #[test]
    fn test_media_kind() {
        let media = |mime: &str| OutboundMedia {
            file_name: "f".into(),
            mime_type: mime.into(),
            bytes: vec![],
        };
        assert_eq!(media("image/png").kind(), "image");
        assert_eq!(media("video/mp4").kind(), "video");
        assert_eq!(media("audio/ogg").kind(), "audio");
        assert_eq!(media("application/pdf").kind(), "document");
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(Channel::Whatsapp, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api_error(400)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(Channel::Whatsapp, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(api_error(502)) }
        })
        .await;

        assert!(matches!(result, Err(ChannelError::Api { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_error() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(Channel::Telegram, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(api_error(503))
                } else {
                    Ok("sent")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
