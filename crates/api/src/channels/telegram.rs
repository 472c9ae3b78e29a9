//! Telegram Bot API client and webhook payloads

use async_trait::async_trait;
use linedesk_shared::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    read_json, timestamp_or_now, with_retry, ChannelError, ChannelSender, InboundMessage,
    OutboundMedia, SentMessage,
};

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, base_url: &str, bot_token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    fn ensure_configured(&self) -> Result<(), ChannelError> {
        if self.bot_token.is_empty() {
            return Err(ChannelError::NotConfigured(Channel::Telegram));
        }
        Ok(())
    }
}

/// Telegram wraps results in `{"ok": bool, "result": ..., "description": ...}`
fn message_id(body: &Value) -> Result<SentMessage, ChannelError> {
    if body["ok"].as_bool() != Some(true) {
        let description = body["description"]
            .as_str()
            .unwrap_or("Unknown Telegram API error");
        return Err(ChannelError::Rejected(description.to_string()));
    }

    body["result"]["message_id"]
        .as_i64()
        .map(|id| SentMessage {
            external_id: id.to_string(),
        })
        .ok_or(ChannelError::InvalidResponse(Channel::Telegram))
}

#[async_trait]
impl ChannelSender for TelegramClient {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn is_configured(&self) -> bool {
        !self.bot_token.is_empty()
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<SentMessage, ChannelError> {
        self.ensure_configured()?;
        let url = self.method_url("sendMessage");
        let payload = SendMessageRequest {
            chat_id: recipient,
            text,
        };

        let body = with_retry(Channel::Telegram, || async {
            let response = self.http.post(&url).json(&payload).send().await?;
            read_json(Channel::Telegram, response).await
        })
        .await?;

        message_id(&body)
    }

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<SentMessage, ChannelError> {
        self.ensure_configured()?;
        let url = self.method_url("sendDocument");

        let body = with_retry(Channel::Telegram, || async {
            let part = reqwest::multipart::Part::bytes(media.bytes.clone())
                .file_name(media.file_name.clone())
                .mime_str(&media.mime_type)?;
            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", recipient.to_string())
                .part("document", part);
            if let Some(caption) = caption.filter(|c| !c.is_empty()) {
                form = form.text("caption", caption.to_string());
            }

            let response = self.http.post(&url).multipart(form).send().await?;
            read_json(Channel::Telegram, response).await
        })
        .await?;

        message_id(&body)
    }
}

// =============================================================================
// Webhook payloads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<Value>>,
    #[serde(default)]
    pub document: Option<Value>,
    #[serde(default)]
    pub voice: Option<Value>,
    #[serde(default)]
    pub video: Option<Value>,
    #[serde(default)]
    pub sticker: Option<Value>,
    #[serde(default)]
    pub contact: Option<TelegramContact>,
    #[serde(default)]
    pub location: Option<TelegramLocation>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramContact {
    pub phone_number: String,
    pub first_name: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramLocation {
    pub latitude: f64,
    pub longitude: f64,
}

fn message_content(message: &TelegramMessage) -> String {
    let labelled = |label: &str| match message.caption.as_deref() {
        Some(caption) if !caption.is_empty() => format!("[{}] {}", label, caption),
        _ => format!("[{}]", label),
    };

    if let Some(text) = &message.text {
        text.clone()
    } else if message.photo.is_some() {
        labelled("image")
    } else if message.video.is_some() {
        labelled("video")
    } else if message.voice.is_some() {
        "[voice]".to_string()
    } else if message.document.is_some() {
        labelled("document")
    } else if message.sticker.is_some() {
        "[sticker]".to_string()
    } else if let Some(contact) = &message.contact {
        format!("[contact] {} {}", contact.first_name, contact.phone_number)
    } else if let Some(loc) = &message.location {
        format!("[location] {}, {}", loc.latitude, loc.longitude)
    } else {
        "[unsupported message]".to_string()
    }
}

/// Extract the inbound message of a Telegram update, if any
///
/// Only private chats are handled; group traffic and bot senders are ignored.
pub fn parse_update(update: &TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message.as_ref()?;
    if message.chat.chat_type != "private" {
        return None;
    }
    let from = message.from.as_ref()?;
    if from.is_bot {
        return None;
    }

    let full_name = match &from.last_name {
        Some(last) if !last.is_empty() => format!("{} {}", from.first_name, last),
        _ => from.first_name.clone(),
    };

    Some(InboundMessage {
        channel: Channel::Telegram,
        sender_id: message.chat.id.to_string(),
        sender_name: Some(full_name),
        sender_username: from.username.clone(),
        // Message ids are unique per chat only
        external_id: format!("{}:{}", message.chat.id, message.message_id),
        content: message_content(message),
        received_at: timestamp_or_now(Some(message.date)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(url: &str) -> TelegramClient {
        TelegramClient::new(reqwest::Client::new(), url, "123:ABC")
    }

    #[tokio::test]
    async fn test_send_text() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .match_body(Matcher::Json(json!({ "chat_id": "4242", "text": "Добрый день" })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":77,"date":1717000000}}"#)
            .create_async()
            .await;

        let sent = client(&server.url())
            .send_text("4242", "Добрый день")
            .await
            .unwrap();

        assert_eq!(sent.external_id, "77");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_blocked_bot_is_permanent_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .with_status(403)
            .with_body(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url()).send_text("4242", "hi").await.unwrap_err();

        assert!(matches!(err, ChannelError::Api { status: 403, .. }));
        assert!(!err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_document_multipart() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:ABC/sendDocument")
            .match_header(
                "content-type",
                Matcher::Regex("multipart/form-data.*".to_string()),
            )
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":78}}"#)
            .create_async()
            .await;

        let media = OutboundMedia {
            file_name: "invoice.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: b"%PDF-1.4".to_vec(),
        };
        let sent = client(&server.url())
            .send_media("4242", &media, Some("Счёт"))
            .await
            .unwrap();

        assert_eq!(sent.external_id, "78");
        mock.assert_async().await;
    }

    #[test]
    fn test_ok_false_is_rejected() {
        let body = json!({ "ok": false, "description": "Bad Request: chat not found" });
        assert!(matches!(message_id(&body), Err(ChannelError::Rejected(_))));
    }

    #[test]
    fn test_parse_private_message() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{
                "update_id": 1,
                "message": {
                    "message_id": 10,
                    "from": {"id": 4242, "is_bot": false, "first_name": "Иван", "last_name": "Петров", "username": "ivanp"},
                    "chat": {"id": 4242, "type": "private"},
                    "date": 1717000000,
                    "text": "Где мой заказ?"
                }
            }"#,
        )
        .unwrap();

        let inbound = parse_update(&update).unwrap();
        assert_eq!(inbound.sender_id, "4242");
        assert_eq!(inbound.sender_name.as_deref(), Some("Иван Петров"));
        assert_eq!(inbound.sender_username.as_deref(), Some("ivanp"));
        assert_eq!(inbound.external_id, "4242:10");
        assert_eq!(inbound.content, "Где мой заказ?");
    }

    #[test]
    fn test_parse_photo_with_caption() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{
                "update_id": 2,
                "message": {
                    "message_id": 11,
                    "from": {"id": 4242, "first_name": "Иван"},
                    "chat": {"id": 4242, "type": "private"},
                    "date": 1717000000,
                    "photo": [{"file_id": "x"}],
                    "caption": "фото чека"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(parse_update(&update).unwrap().content, "[image] фото чека");
    }

    #[test]
    fn test_group_messages_ignored() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{
                "update_id": 3,
                "message": {
                    "message_id": 12,
                    "from": {"id": 1, "first_name": "A"},
                    "chat": {"id": -100, "type": "group"},
                    "date": 1717000000,
                    "text": "hello"
                }
            }"#,
        )
        .unwrap();

        assert!(parse_update(&update).is_none());
    }
}
