//! AI agent client for chat auto-replies
//!
//! Talks to any OpenAI-compatible `chat/completions` endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a polite contact-center assistant. \
Answer the client briefly in the language they wrote in. \
If you cannot help, say that an operator will reply soon.";

#[derive(Debug, thiserror::Error)]
pub enum AiAgentError {
    #[error("AI agent is not configured")]
    NotConfigured,
    #[error("AI agent request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("AI agent returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("AI agent returned an empty reply")]
    EmptyReply,
}

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatTurn,
}

#[derive(Clone)]
pub struct AiAgentClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    default_model: String,
}

impl AiAgentClient {
    pub fn new(endpoint: &str, api_key: &str, default_model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.ai_agent_url,
            &config.ai_agent_api_key,
            &config.ai_agent_model,
        )
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Generate a reply to the conversation.
    ///
    /// `history` is oldest first. `prompt` and `model` override the defaults
    /// when the client's AI setting provides them.
    pub async fn reply(
        &self,
        history: &[ChatTurn],
        prompt: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, AiAgentError> {
        if !self.is_configured() {
            return Err(AiAgentError::NotConfigured);
        }

        let system = prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatTurn::new(ChatRole::System, system));
        messages.extend(history.iter().cloned());

        let request = CompletionRequest {
            model: model
                .filter(|m| !m.is_empty())
                .unwrap_or(&self.default_model),
            messages,
            temperature: 0.3,
            max_tokens: 512,
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "AI agent request failed");
            return Err(AiAgentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response.json().await?;
        let reply = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();

        if reply.is_empty() {
            return Err(AiAgentError::EmptyReply);
        }

        tracing::debug!(reply_len = reply.len(), "AI agent replied");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_sends_history_with_system_prompt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    { "role": "system", "content": "Отвечай кратко" },
                    { "role": "user", "content": "Когда доставка?" }
                ]
            })))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"index":0,"message":{"role":"assistant","content":" Завтра до 18:00. "}}]}"#,
            )
            .create_async()
            .await;

        let client = AiAgentClient::new(&server.url(), "sk-test", "gpt-4o-mini");
        let reply = client
            .reply(
                &[ChatTurn::new(ChatRole::User, "Когда доставка?")],
                Some("Отвечай кратко"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(reply, "Завтра до 18:00.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_model_override() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({ "model": "llama-3" })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#)
            .create_async()
            .await;

        let client = AiAgentClient::new(&server.url(), "", "gpt-4o-mini");
        client
            .reply(&[ChatTurn::new(ChatRole::User, "hi")], None, Some("llama-3"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"invalid api key"}}"#)
            .create_async()
            .await;

        let client = AiAgentClient::new(&server.url(), "bad", "gpt-4o-mini");
        let err = client
            .reply(&[ChatTurn::new(ChatRole::User, "hi")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AiAgentError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_empty_reply() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let client = AiAgentClient::new(&server.url(), "", "gpt-4o-mini");
        let err = client
            .reply(&[ChatTurn::new(ChatRole::User, "hi")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AiAgentError::EmptyReply));
    }

    #[tokio::test]
    async fn test_not_configured() {
        let client = AiAgentClient::new("", "", "gpt-4o-mini");
        assert!(matches!(
            client.reply(&[], None, None).await,
            Err(AiAgentError::NotConfigured)
        ));
    }
}
