//! Report delivery by email
//!
//! Sends scheduled report emails via the Resend API.

use serde_json::Value;

use crate::config::Config;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email is not configured")]
    NotConfigured,
    #[error("No recipients")]
    NoRecipients,
    #[error("Email request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Email API returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Report email sender
#[derive(Clone)]
pub struct ReportMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    dashboard_url: String,
}

impl ReportMailer {
    pub fn new(api_url: &str, api_key: &str, from: &str, dashboard_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RESEND_API_URL,
            &config.resend_api_key,
            &config.email_from,
            &config.public_url,
        )
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Send an email via Resend API
    async fn send_email(&self, to: &[String], subject: &str, html: &str) -> Result<(), EmailError> {
        if !self.is_enabled() {
            tracing::warn!(subject = %subject, "Email not configured, skipping");
            return Err(EmailError::NotConfigured);
        }
        if to.is_empty() {
            return Err(EmailError::NoRecipients);
        }

        let body = serde_json::json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Failed to send report email");
            return Err(EmailError::Api {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(recipients = to.len(), subject = %subject, "Report email sent");
        Ok(())
    }

    /// Send a generated report to its recipients
    pub async fn send_report(
        &self,
        to: &[String],
        report_name: &str,
        period: &str,
        payload: &Value,
    ) -> Result<(), EmailError> {
        let subject = format!("{} ({})", report_name, period);
        let html = render_report_html(report_name, period, payload, &self.dashboard_url);
        self.send_email(to, &subject, &html).await
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => escape_html(s),
        Value::Null => "-".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() != 0.0 => format!("{:.2}", f),
            _ => n.to_string(),
        },
        other => escape_html(&other.to_string()),
    }
}

/// Render objects as key/value tables and arrays of objects as row tables
fn render_section(title: &str, value: &Value) -> String {
    let heading = format!(
        "<h3 style=\"margin: 24px 0 8px 0;\">{}</h3>",
        escape_html(&title.replace('_', " "))
    );
    let table_open =
        "<table style=\"border-collapse: collapse; width: 100%; font-size: 14px;\">";
    let td = "style=\"border: 1px solid #e5e7eb; padding: 6px 10px;\"";

    match value {
        Value::Object(map) => {
            let rows: String = map
                .iter()
                .map(|(k, v)| format!("<tr><td {td}>{}</td><td {td}>{}</td></tr>", escape_html(k), cell(v)))
                .collect();
            format!("{heading}{table_open}{rows}</table>")
        }
        Value::Array(items) => {
            let Some(Value::Object(first)) = items.first() else {
                return format!("{heading}<p>No data</p>");
            };
            let columns: Vec<&String> = first.keys().collect();
            let header: String = columns
                .iter()
                .map(|c| format!("<th {td}>{}</th>", escape_html(&c.replace('_', " "))))
                .collect();
            let rows: String = items
                .iter()
                .map(|item| {
                    let cells: String = columns
                        .iter()
                        .map(|c| format!("<td {td}>{}</td>", cell(&item[c.as_str()])))
                        .collect();
                    format!("<tr>{cells}</tr>")
                })
                .collect();
            format!("{heading}{table_open}<tr>{header}</tr>{rows}</table>")
        }
        scalar => format!("{heading}<p>{}</p>", cell(scalar)),
    }
}

pub fn render_report_html(report_name: &str, period: &str, payload: &Value, dashboard_url: &str) -> String {
    let mut scalars = serde_json::Map::new();
    let mut sections = String::new();

    if let Value::Object(map) = payload {
        for (key, value) in map {
            match value {
                Value::Object(_) | Value::Array(_) => sections.push_str(&render_section(key, value)),
                other => {
                    scalars.insert(key.clone(), other.clone());
                }
            }
        }
    }

    let summary = if scalars.is_empty() {
        String::new()
    } else {
        render_section("summary", &Value::Object(scalars))
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 720px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #1d4ed8;">{name}</h2>
    <p style="color: #666;">{period}</p>
    {summary}
    {sections}
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;"><a href="{dashboard}">LineDesk</a></p>
</body>
</html>"#,
        name = escape_html(report_name),
        period = escape_html(period),
        summary = summary,
        sections = sections,
        dashboard = dashboard_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_send_report() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(Matcher::PartialJson(json!({
                "from": "LineDesk <reports@example.com>",
                "to": ["boss@example.com"],
                "subject": "Tickets summary (2024-06-01 - 2024-06-02)"
            })))
            .with_status(200)
            .with_body(r#"{"id":"email-1"}"#)
            .create_async()
            .await;

        let mailer = ReportMailer::new(
            &format!("{}/emails", server.url()),
            "re_test",
            "LineDesk <reports@example.com>",
            "https://crm.example.com",
        );
        mailer
            .send_report(
                &["boss@example.com".to_string()],
                "Tickets summary",
                "2024-06-01 - 2024-06-02",
                &json!({ "created": 12 }),
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_disabled_mailer() {
        let mailer = ReportMailer::new(RESEND_API_URL, "", "x@example.com", "");
        let err = mailer
            .send_report(&["a@example.com".into()], "r", "p", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EmailError::NotConfigured));
    }

    #[test]
    fn test_render_report_html() {
        let html = render_report_html(
            "Operator performance",
            "June",
            &json!({
                "total": 3,
                "operators": [
                    { "full_name": "Анна <A>", "resolved": 5, "avg_hours": 1.256 },
                    { "full_name": "Борис", "resolved": 2, "avg_hours": null }
                ]
            }),
            "https://crm.example.com",
        );

        assert!(html.contains("Operator performance"));
        assert!(html.contains("Анна &lt;A&gt;"));
        assert!(html.contains("1.26"));
        assert!(html.contains("<td style=\"border: 1px solid #e5e7eb; padding: 6px 10px;\">-</td>"));
        assert!(html.contains("full name"));
    }
}
