//! Instagram Messaging API client and webhook payloads

use async_trait::async_trait;
use linedesk_shared::Channel;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    read_json, timestamp_or_now, with_retry, ChannelError, ChannelSender, InboundMessage,
    OutboundMedia, SentMessage,
};

#[derive(Clone)]
pub struct InstagramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    page_id: String,
}

impl InstagramClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str, page_id: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            page_id: page_id.to_string(),
        }
    }

    fn ensure_configured(&self) -> Result<(), ChannelError> {
        if self.token.is_empty() || self.page_id.is_empty() {
            return Err(ChannelError::NotConfigured(Channel::Instagram));
        }
        Ok(())
    }

    async fn post_message(&self, payload: Value) -> Result<SentMessage, ChannelError> {
        self.ensure_configured()?;
        let url = format!("{}/{}/messages", self.base_url, self.page_id);

        let body = with_retry(Channel::Instagram, || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await?;
            read_json(Channel::Instagram, response).await
        })
        .await?;

        body["message_id"]
            .as_str()
            .map(|id| SentMessage {
                external_id: id.to_string(),
            })
            .ok_or(ChannelError::InvalidResponse(Channel::Instagram))
    }

    /// Upload an attachment and return its reusable attachment id
    async fn upload_attachment(&self, media: &OutboundMedia) -> Result<String, ChannelError> {
        let url = format!("{}/{}/message_attachments", self.base_url, self.page_id);
        let kind = attachment_type(media);

        let body = with_retry(Channel::Instagram, || async {
            let part = reqwest::multipart::Part::bytes(media.bytes.clone())
                .file_name(media.file_name.clone())
                .mime_str(&media.mime_type)?;
            let message = json!({
                "attachment": { "type": kind, "payload": { "is_reusable": true } }
            });
            let form = reqwest::multipart::Form::new()
                .text("message", message.to_string())
                .part("filedata", part);

            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .multipart(form)
                .send()
                .await?;
            read_json(Channel::Instagram, response).await
        })
        .await?;

        body["attachment_id"]
            .as_str()
            .map(str::to_string)
            .ok_or(ChannelError::InvalidResponse(Channel::Instagram))
    }
}

/// Instagram only knows image, video, audio and generic files
fn attachment_type(media: &OutboundMedia) -> &'static str {
    match media.kind() {
        "document" => "file",
        other => other,
    }
}

#[async_trait]
impl ChannelSender for InstagramClient {
    fn channel(&self) -> Channel {
        Channel::Instagram
    }

    fn is_configured(&self) -> bool {
        self.ensure_configured().is_ok()
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<SentMessage, ChannelError> {
        self.post_message(json!({
            "recipient": { "id": recipient },
            "message": { "text": text },
        }))
        .await
    }

    async fn send_media(
        &self,
        recipient: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<SentMessage, ChannelError> {
        self.ensure_configured()?;
        let attachment_id = self.upload_attachment(media).await?;

        let sent = self
            .post_message(json!({
                "recipient": { "id": recipient },
                "message": {
                    "attachment": {
                        "type": attachment_type(media),
                        "payload": { "attachment_id": attachment_id }
                    }
                },
            }))
            .await?;

        // Attachments cannot carry text, so the caption follows as its own message
        if let Some(caption) = caption.filter(|c| !c.is_empty()) {
            self.send_text(recipient, caption).await?;
        }

        Ok(sent)
    }
}

// =============================================================================
// Webhook payloads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InstagramWebhook {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<InstagramEntry>,
}

#[derive(Debug, Deserialize)]
pub struct InstagramEntry {
    pub id: String,
    #[serde(default)]
    pub messaging: Vec<InstagramMessaging>,
}

#[derive(Debug, Deserialize)]
pub struct InstagramMessaging {
    pub sender: InstagramUser,
    pub recipient: InstagramUser,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<InstagramMessageContent>,
}

#[derive(Debug, Deserialize)]
pub struct InstagramUser {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct InstagramMessageContent {
    pub mid: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<InstagramAttachment>,
    #[serde(default)]
    pub is_echo: bool,
}

#[derive(Debug, Deserialize)]
pub struct InstagramAttachment {
    #[serde(rename = "type")]
    pub attachment_type: String,
}

/// Extract inbound direct messages from an Instagram webhook delivery
///
/// Echoes of messages sent by the page itself are skipped.
pub fn parse_webhook(payload: &InstagramWebhook) -> Vec<InboundMessage> {
    if payload.object != "instagram" {
        return Vec::new();
    }

    payload
        .entry
        .iter()
        .flat_map(|entry| {
            entry.messaging.iter().filter_map(move |messaging| {
                let message = messaging.message.as_ref()?;
                if message.is_echo || messaging.sender.id == entry.id {
                    return None;
                }

                let content = match (&message.text, message.attachments.first()) {
                    (Some(text), _) => text.clone(),
                    (None, Some(att)) => format!("[{}]", att.attachment_type),
                    (None, None) => return None,
                };

                // Instagram timestamps are milliseconds
                let received_at = timestamp_or_now(messaging.timestamp.map(|ms| ms / 1000));

                Some(InboundMessage {
                    channel: Channel::Instagram,
                    sender_id: messaging.sender.id.clone(),
                    sender_name: None,
                    sender_username: None,
                    external_id: message.mid.clone(),
                    content,
                    received_at,
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(url: &str) -> InstagramClient {
        InstagramClient::new(reqwest::Client::new(), url, "ig-token", "9000")
    }

    #[tokio::test]
    async fn test_send_text() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/9000/messages")
            .match_header("authorization", "Bearer ig-token")
            .match_body(Matcher::Json(json!({
                "recipient": { "id": "17841400000" },
                "message": { "text": "Спасибо за обращение" }
            })))
            .with_status(200)
            .with_body(r#"{"recipient_id":"17841400000","message_id":"mid.XYZ"}"#)
            .create_async()
            .await;

        let sent = client(&server.url())
            .send_text("17841400000", "Спасибо за обращение")
            .await
            .unwrap();

        assert_eq!(sent.external_id, "mid.XYZ");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limited_is_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/9000/messages")
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server.url())
            .send_text("17841400000", "hi")
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Api { status: 429, .. }));
        mock.assert_async().await;
    }

    #[test]
    fn test_parse_webhook_skips_echoes() {
        let payload: InstagramWebhook = serde_json::from_str(
            r#"{
                "object": "instagram",
                "entry": [{
                    "id": "9000",
                    "time": 1717000000000,
                    "messaging": [
                        {"sender": {"id": "555"}, "recipient": {"id": "9000"}, "timestamp": 1717000000000,
                         "message": {"mid": "m1", "text": "Привет"}},
                        {"sender": {"id": "9000"}, "recipient": {"id": "555"}, "timestamp": 1717000001000,
                         "message": {"mid": "m2", "text": "Ответ", "is_echo": true}},
                        {"sender": {"id": "555"}, "recipient": {"id": "9000"}, "timestamp": 1717000002000,
                         "message": {"mid": "m3", "attachments": [{"type": "image", "payload": {"url": "https://x"}}]}}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let inbound = parse_webhook(&payload);
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].sender_id, "555");
        assert_eq!(inbound[0].content, "Привет");
        assert_eq!(inbound[0].received_at.unix_timestamp(), 1_717_000_000);
        assert_eq!(inbound[1].content, "[image]");
    }
}
