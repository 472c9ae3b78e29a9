//! WhatsApp Cloud API and WABA template management

use async_trait::async_trait;
use linedesk_shared::{workflow::normalize_phone, Channel, TemplateCategory, TemplateStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    read_json, timestamp_or_now, with_retry, ChannelError, ChannelSender, InboundMessage,
    OutboundMedia, SentMessage,
};

#[derive(Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    phone_number_id: String,
    waba_account_id: String,
}

/// Template as returned by the WABA management API
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTemplate {
    pub external_id: String,
    pub name: String,
    pub language: String,
    pub category: Option<TemplateCategory>,
    pub status: TemplateStatus,
    pub header: Option<String>,
    pub body: String,
    pub footer: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Template submission for Meta review
#[derive(Debug, Clone)]
pub struct TemplateSubmission<'a> {
    pub name: &'a str,
    pub language: &'a str,
    pub category: TemplateCategory,
    pub header: Option<&'a str>,
    pub body: &'a str,
    pub footer: Option<&'a str>,
    pub variables_count: usize,
}

impl WhatsAppClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        token: &str,
        phone_number_id: &str,
        waba_account_id: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            waba_account_id: waba_account_id.to_string(),
        }
    }

    fn ensure_configured(&self) -> Result<(), ChannelError> {
        if self.token.is_empty() || self.phone_number_id.is_empty() {
            return Err(ChannelError::NotConfigured(Channel::Whatsapp));
        }
        Ok(())
    }

    fn ensure_waba_configured(&self) -> Result<(), ChannelError> {
        if self.token.is_empty() || self.waba_account_id.is_empty() {
            return Err(ChannelError::NotConfigured(Channel::Whatsapp));
        }
        Ok(())
    }

    async fn post_message(&self, payload: Value) -> Result<SentMessage, ChannelError> {
        self.ensure_configured()?;
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);

        let body = with_retry(Channel::Whatsapp, || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await?;
            read_json(Channel::Whatsapp, response).await
        })
        .await?;

        body["messages"][0]["id"]
            .as_str()
            .map(|id| SentMessage {
                external_id: id.to_string(),
            })
            .ok_or(ChannelError::InvalidResponse(Channel::Whatsapp))
    }

    /// Send an approved template with positional body parameters
    pub async fn send_template(
        &self,
        to: &str,
        name: &str,
        language: &str,
        variables: &[String],
    ) -> Result<SentMessage, ChannelError> {
        let mut template = json!({
            "name": name,
            "language": { "code": language },
        });

        if !variables.is_empty() {
            let parameters: Vec<Value> = variables
                .iter()
                .map(|v| json!({ "type": "text", "text": v }))
                .collect();
            template["components"] = json!([{ "type": "body", "parameters": parameters }]);
        }

        self.post_message(json!({
            "messaging_product": "whatsapp",
            "to": normalize_phone(to),
            "type": "template",
            "template": template,
        }))
        .await
    }

    /// Upload a file and return its media id
    async fn upload_media(&self, media: &OutboundMedia) -> Result<String, ChannelError> {
        let url = format!("{}/{}/media", self.base_url, self.phone_number_id);

        let body = with_retry(Channel::Whatsapp, || async {
            let part = reqwest::multipart::Part::bytes(media.bytes.clone())
                .file_name(media.file_name.clone())
                .mime_str(&media.mime_type)?;
            let form = reqwest::multipart::Form::new()
                .text("messaging_product", "whatsapp")
                .text("type", media.mime_type.clone())
                .part("file", part);

            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .multipart(form)
                .send()
                .await?;
            read_json(Channel::Whatsapp, response).await
        })
        .await?;

        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or(ChannelError::InvalidResponse(Channel::Whatsapp))
    }

    /// List message templates registered on the WABA account
    pub async fn list_templates(&self) -> Result<Vec<RemoteTemplate>, ChannelError> {
        self.ensure_waba_configured()?;
        let url = format!("{}/{}/message_templates", self.base_url, self.waba_account_id);

        let body = with_retry(Channel::Whatsapp, || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("limit", "200")])
                .send()
                .await?;
            read_json(Channel::Whatsapp, response).await
        })
        .await?;

        let list: TemplateList = serde_json::from_value(body)
            .map_err(|_| ChannelError::InvalidResponse(Channel::Whatsapp))?;
        Ok(list.data.into_iter().map(RemoteTemplate::from).collect())
    }

    /// Submit a template for review, returning its id and initial status
    pub async fn create_template(
        &self,
        submission: &TemplateSubmission<'_>,
    ) -> Result<(String, TemplateStatus), ChannelError> {
        self.ensure_waba_configured()?;
        let url = format!("{}/{}/message_templates", self.base_url, self.waba_account_id);
        let payload = template_payload(submission);

        let body = with_retry(Channel::Whatsapp, || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await?;
            read_json(Channel::Whatsapp, response).await
        })
        .await?;

        let id = body["id"]
            .as_str()
            .ok_or(ChannelError::InvalidResponse(Channel::Whatsapp))?;
        let status = body["status"]
            .as_str()
            .map(TemplateStatus::from_meta)
            .unwrap_or(TemplateStatus::Pending);
        Ok((id.to_string(), status))
    }

    /// Delete every language of a template by name
    pub async fn delete_template(&self, name: &str) -> Result<(), ChannelError> {
        self.ensure_waba_configured()?;
        let url = format!("{}/{}/message_templates", self.base_url, self.waba_account_id);

        with_retry(Channel::Whatsapp, || async {
            let response = self
                .http
                .delete(&url)
                .bearer_auth(&self.token)
                .query(&[("name", name)])
                .send()
                .await?;
            read_json(Channel::Whatsapp, response).await
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelSender for WhatsAppClient {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn is_configured(&self) -> bool {
        self.ensure_configured().is_ok()
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<SentMessage, ChannelError> {
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": normalize_phone(recipient),
            "type": "text",
            "text": { "body": text, "preview_url": false },
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
        let media_id = self.upload_media(media).await?;
        let kind = media.kind();

        let mut object = json!({ "id": media_id });
        // Audio messages cannot carry a caption
        if kind != "audio" {
            if let Some(caption) = caption.filter(|c| !c.is_empty()) {
                object["caption"] = json!(caption);
            }
        }
        if kind == "document" {
            object["filename"] = json!(media.file_name);
        }

        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": normalize_phone(recipient),
            "type": kind,
        });
        payload[kind] = object;

        self.post_message(payload).await
    }
}

fn template_payload(submission: &TemplateSubmission<'_>) -> Value {
    let mut components = Vec::new();

    if let Some(header) = submission.header.filter(|h| !h.is_empty()) {
        components.push(json!({ "type": "HEADER", "format": "TEXT", "text": header }));
    }

    let mut body = json!({ "type": "BODY", "text": submission.body });
    if submission.variables_count > 0 {
        let examples: Vec<String> = (1..=submission.variables_count)
            .map(|i| format!("example{}", i))
            .collect();
        body["example"] = json!({ "body_text": [examples] });
    }
    components.push(body);

    if let Some(footer) = submission.footer.filter(|f| !f.is_empty()) {
        components.push(json!({ "type": "FOOTER", "text": footer }));
    }

    json!({
        "name": submission.name,
        "language": submission.language,
        "category": submission.category.as_meta_str(),
        "components": components,
    })
}

// =============================================================================
// WABA management payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct TemplateList {
    #[serde(default)]
    data: Vec<TemplateItem>,
}

#[derive(Debug, Deserialize)]
struct TemplateItem {
    id: String,
    name: String,
    language: String,
    status: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    rejected_reason: Option<String>,
    #[serde(default)]
    components: Vec<TemplateComponent>,
}

#[derive(Debug, Deserialize)]
struct TemplateComponent {
    #[serde(rename = "type")]
    component_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl From<TemplateItem> for RemoteTemplate {
    fn from(item: TemplateItem) -> Self {
        let text_of = |kind: &str| {
            item.components
                .iter()
                .find(|c| c.component_type.eq_ignore_ascii_case(kind))
                .and_then(|c| c.text.clone())
        };

        let category = match item.category.as_deref().map(str::to_uppercase).as_deref() {
            Some("MARKETING") => Some(TemplateCategory::Marketing),
            Some("UTILITY") => Some(TemplateCategory::Utility),
            Some("AUTHENTICATION") => Some(TemplateCategory::Authentication),
            _ => None,
        };

        RemoteTemplate {
            header: text_of("HEADER"),
            body: text_of("BODY").unwrap_or_default(),
            footer: text_of("FOOTER"),
            external_id: item.id,
            name: item.name,
            language: item.language,
            category,
            status: TemplateStatus::from_meta(&item.status),
            rejection_reason: item.rejected_reason.filter(|r| r != "NONE"),
        }
    }
}

// =============================================================================
// Webhook payloads
// =============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

impl WebhookVerifyQuery {
    /// Return the challenge when the subscription request carries the expected token
    pub fn accept(&self, expected_token: &str) -> Option<String> {
        let mode_ok = self.mode.as_deref() == Some("subscribe");
        let token_ok = super::signature::token_matches(expected_token, self.verify_token.as_deref());
        (mode_ok && token_ok).then(|| self.challenge.clone().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppWebhook {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppEntry {
    #[serde(default)]
    pub changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppChange {
    pub field: String,
    pub value: WhatsAppValue,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppValue {
    #[serde(default)]
    pub contacts: Vec<WhatsAppContact>,
    #[serde(default)]
    pub messages: Vec<WhatsAppMessage>,
    #[serde(default)]
    pub statuses: Vec<WhatsAppStatus>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppContact {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppProfile {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<WhatsAppText>,
    #[serde(default)]
    pub image: Option<WhatsAppMedia>,
    #[serde(default)]
    pub video: Option<WhatsAppMedia>,
    #[serde(default)]
    pub document: Option<WhatsAppMedia>,
    #[serde(default)]
    pub location: Option<WhatsAppLocation>,
    #[serde(default)]
    pub interactive: Option<WhatsAppInteractive>,
    #[serde(default)]
    pub button: Option<WhatsAppButton>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppMedia {
    pub id: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppInteractive {
    #[serde(rename = "type")]
    pub interactive_type: String,
    #[serde(default)]
    pub button_reply: Option<WhatsAppReply>,
    #[serde(default)]
    pub list_reply: Option<WhatsAppReply>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppReply {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppButton {
    pub text: String,
}

/// Delivery status callback for a message we sent
#[derive(Debug, Deserialize)]
pub struct WhatsAppStatus {
    pub id: String,
    pub status: String,
}

fn message_content(message: &WhatsAppMessage) -> String {
    let with_caption = |label: &str, media: &Option<WhatsAppMedia>| {
        match media.as_ref().and_then(|m| m.caption.as_deref()) {
            Some(caption) if !caption.is_empty() => format!("[{}] {}", label, caption),
            _ => format!("[{}]", label),
        }
    };

    match message.message_type.as_str() {
        "text" => message
            .text
            .as_ref()
            .map(|t| t.body.clone())
            .unwrap_or_default(),
        "interactive" => message
            .interactive
            .as_ref()
            .and_then(|i| match i.interactive_type.as_str() {
                "button_reply" => i.button_reply.as_ref(),
                "list_reply" => i.list_reply.as_ref(),
                _ => None,
            })
            .map(|r| r.title.clone())
            .unwrap_or_default(),
        "button" => message
            .button
            .as_ref()
            .map(|b| b.text.clone())
            .unwrap_or_default(),
        "image" => with_caption("image", &message.image),
        "video" => with_caption("video", &message.video),
        "document" => with_caption("document", &message.document),
        "location" => match &message.location {
            Some(loc) => format!(
                "[location] {}, {}{}",
                loc.latitude,
                loc.longitude,
                loc.name
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            ),
            None => "[location]".to_string(),
        },
        other => format!("[{}]", other),
    }
}

/// Extract inbound messages from a WhatsApp webhook delivery
pub fn parse_webhook(payload: &WhatsAppWebhook) -> Vec<InboundMessage> {
    if payload.object != "whatsapp_business_account" {
        return Vec::new();
    }

    let mut inbound = Vec::new();
    for change in payload.entry.iter().flat_map(|e| &e.changes) {
        if change.field != "messages" {
            continue;
        }

        for message in &change.value.messages {
            let contact = change.value.contacts.iter().find(|c| c.wa_id == message.from);
            inbound.push(InboundMessage {
                channel: Channel::Whatsapp,
                sender_id: normalize_phone(&message.from),
                sender_name: contact.and_then(|c| c.profile.as_ref()).map(|p| p.name.clone()),
                sender_username: None,
                external_id: message.id.clone(),
                content: message_content(message),
                received_at: timestamp_or_now(
                    message.timestamp.as_deref().and_then(|t| t.parse().ok()),
                ),
            });
        }

        for status in &change.value.statuses {
            tracing::debug!(message_id = %status.id, status = %status.status, "WhatsApp delivery status");
        }
    }

    inbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(url: &str) -> WhatsAppClient {
        WhatsAppClient::new(reqwest::Client::new(), url, "wa-token", "10001", "20002")
    }

    #[tokio::test]
    async fn test_send_text_builds_cloud_api_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/10001/messages")
            .match_header("authorization", "Bearer wa-token")
            .match_body(Matcher::PartialJson(json!({
                "messaging_product": "whatsapp",
                "to": "79161234567",
                "type": "text",
                "text": { "body": "Здравствуйте!" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messaging_product":"whatsapp","messages":[{"id":"wamid.ABC"}]}"#)
            .create_async()
            .await;

        let sent = client(&server.url())
            .send_text("8 (916) 123-45-67", "Здравствуйте!")
            .await
            .unwrap();

        assert_eq!(sent.external_id, "wamid.ABC");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_template_with_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/10001/messages")
            .match_body(Matcher::PartialJson(json!({
                "type": "template",
                "template": {
                    "name": "order_ready",
                    "language": { "code": "ru" },
                    "components": [{
                        "type": "body",
                        "parameters": [
                            { "type": "text", "text": "Анна" },
                            { "type": "text", "text": "A-17" }
                        ]
                    }]
                }
            })))
            .with_status(200)
            .with_body(r#"{"messages":[{"id":"wamid.T1"}]}"#)
            .create_async()
            .await;

        let sent = client(&server.url())
            .send_template(
                "79161234567",
                "order_ready",
                "ru",
                &["Анна".to_string(), "A-17".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(sent.external_id, "wamid.T1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/10001/messages")
            .with_status(400)
            .with_body(r#"{"error":{"message":"Invalid parameter"}}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url())
            .send_text("79161234567", "hi")
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Api { status: 400, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/10001/messages")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server.url())
            .send_text("79161234567", "hi")
            .await
            .unwrap_err();

        assert!(err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_configured() {
        let client = WhatsAppClient::new(reqwest::Client::new(), "http://localhost", "", "", "");
        assert!(!client.is_configured());
        assert!(matches!(
            client.send_text("79161234567", "hi").await,
            Err(ChannelError::NotConfigured(Channel::Whatsapp))
        ));
    }

    #[tokio::test]
    async fn test_list_templates() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/20002/message_templates")
            .match_query(Matcher::UrlEncoded("limit".into(), "200".into()))
            .with_status(200)
            .with_body(
                r#"{"data":[{
                    "id":"555","name":"order_ready","language":"ru","status":"APPROVED",
                    "category":"UTILITY",
                    "components":[
                        {"type":"HEADER","format":"TEXT","text":"Заказ"},
                        {"type":"BODY","text":"{{1}}, ваш заказ {{2}} готов"}
                    ]
                },{
                    "id":"556","name":"promo","language":"ru","status":"REJECTED",
                    "category":"MARKETING","rejected_reason":"PROMOTIONAL",
                    "components":[{"type":"BODY","text":"Скидка"}]
                }]}"#,
            )
            .create_async()
            .await;

        let templates = client(&server.url()).list_templates().await.unwrap();

        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].status, TemplateStatus::Approved);
        assert_eq!(templates[0].header.as_deref(), Some("Заказ"));
        assert_eq!(templates[0].body, "{{1}}, ваш заказ {{2}} готов");
        assert_eq!(templates[0].category, Some(TemplateCategory::Utility));
        assert_eq!(templates[1].status, TemplateStatus::Rejected);
        assert_eq!(templates[1].rejection_reason.as_deref(), Some("PROMOTIONAL"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_template_sends_examples() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/20002/message_templates")
            .match_body(Matcher::PartialJson(json!({
                "name": "order_ready",
                "category": "UTILITY",
                "components": [{
                    "type": "BODY",
                    "example": { "body_text": [["example1", "example2"]] }
                }]
            })))
            .with_status(200)
            .with_body(r#"{"id":"777","status":"PENDING","category":"UTILITY"}"#)
            .create_async()
            .await;

        let (id, status) = client(&server.url())
            .create_template(&TemplateSubmission {
                name: "order_ready",
                language: "ru",
                category: TemplateCategory::Utility,
                header: None,
                body: "{{1}}, ваш заказ {{2}} готов",
                footer: None,
                variables_count: 2,
            })
            .await
            .unwrap();

        assert_eq!(id, "777");
        assert_eq!(status, TemplateStatus::Pending);
        mock.assert_async().await;
    }

    #[test]
    fn test_parse_webhook_text_and_media() {
        let payload: WhatsAppWebhook = serde_json::from_str(
            r#"{
                "object": "whatsapp_business_account",
                "entry": [{
                    "id": "1",
                    "changes": [{
                        "field": "messages",
                        "value": {
                            "messaging_product": "whatsapp",
                            "contacts": [{"wa_id": "79161234567", "profile": {"name": "Анна"}}],
                            "messages": [
                                {"id": "wamid.1", "from": "79161234567", "timestamp": "1717000000",
                                 "type": "text", "text": {"body": "Добрый день"}},
                                {"id": "wamid.2", "from": "79161234567", "timestamp": "1717000001",
                                 "type": "image", "image": {"id": "m1", "caption": "чек"}}
                            ]
                        }
                    }]
                }]
            }"#,
        )
        .unwrap();

        let inbound = parse_webhook(&payload);
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].sender_id, "79161234567");
        assert_eq!(inbound[0].sender_name.as_deref(), Some("Анна"));
        assert_eq!(inbound[0].content, "Добрый день");
        assert_eq!(inbound[0].received_at.unix_timestamp(), 1_717_000_000);
        assert_eq!(inbound[1].content, "[image] чек");
    }

    #[test]
    fn test_parse_webhook_ignores_other_objects() {
        let payload = WhatsAppWebhook {
            object: "page".into(),
            entry: vec![],
        };
        assert!(parse_webhook(&payload).is_empty());
    }

    #[test]
    fn test_verify_query() {
        let query = WebhookVerifyQuery {
            mode: Some("subscribe".into()),
            verify_token: Some("verify-me".into()),
            challenge: Some("12345".into()),
        };
        assert_eq!(query.accept("verify-me").as_deref(), Some("12345"));
        assert_eq!(query.accept("other"), None);
    }
}
