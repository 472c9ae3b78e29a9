//! WABA template campaigns
//!
//! A campaign sends one approved template to a fixed set of clients.
//! Recipients are materialized when the campaign is created; delivery runs
//! either on launch or from the worker once `scheduled_at` passes.

use linedesk_shared::{
    workflow::{check_template_variables, render_template},
    CampaignStatus, RecipientStatus, TemplateStatus,
};
use serde::Serialize;
use sqlx::{types::Json, FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    channels::WhatsAppClient,
    error::{ApiError, ApiResult},
};

pub const CAMPAIGN_COLUMNS: &str = r#"
    id, name, template_id, status, variables, scheduled_at, started_at, finished_at,
    total_recipients, sent_count, failed_count, created_by, created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CampaignRow {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub status: CampaignStatus,
    pub variables: Json<Vec<String>>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecipientRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub phone: Option<String>,
    pub status: RecipientStatus,
    pub message_id: Option<Uuid>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
}

#[derive(FromRow)]
struct TemplateForSend {
    name: String,
    language: String,
    body: String,
    status: TemplateStatus,
}

async fn fetch_campaign(conn: &mut PgConnection, campaign_id: Uuid) -> ApiResult<CampaignRow> {
    sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {} FROM waba_campaigns WHERE id = $1",
        CAMPAIGN_COLUMNS
    ))
    .bind(campaign_id)
    .fetch_optional(conn)
    .await?
    .ok_or(ApiError::NotFound)
}

pub async fn get_campaign(pool: &PgPool, campaign_id: Uuid) -> ApiResult<CampaignRow> {
    let mut conn = pool.acquire().await?;
    fetch_campaign(&mut conn, campaign_id).await
}

async fn fetch_template(
    conn: &mut PgConnection,
    template_id: Uuid,
) -> Result<Option<TemplateForSend>, sqlx::Error> {
    sqlx::query_as::<_, TemplateForSend>(
        "SELECT name, language, body, status FROM waba_templates WHERE id = $1",
    )
    .bind(template_id)
    .fetch_optional(conn)
    .await
}

// =============================================================================
// Creation
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub template_id: Uuid,
    pub variables: Vec<String>,
    pub client_ids: Vec<Uuid>,
    pub scheduled_at: Option<OffsetDateTime>,
}

pub async fn create_campaign(
    pool: &PgPool,
    actor: &AuthUser,
    new: NewCampaign,
) -> ApiResult<CampaignRow> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Campaign name is required".into()));
    }
    if new.client_ids.is_empty() {
        return Err(ApiError::Validation("Campaign needs at least one recipient".into()));
    }
    if new
        .scheduled_at
        .is_some_and(|at| at <= OffsetDateTime::now_utc())
    {
        return Err(ApiError::Validation("scheduled_at must be in the future".into()));
    }

    let mut tx = pool.begin().await?;

    let template = fetch_template(&mut tx, new.template_id)
        .await?
        .ok_or_else(|| ApiError::Validation("Template does not exist".into()))?;
    check_template_variables(&template.body, &new.variables)?;

    let status = if new.scheduled_at.is_some() {
        CampaignStatus::Scheduled
    } else {
        CampaignStatus::Draft
    };

    let campaign_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO waba_campaigns (name, template_id, status, variables, scheduled_at, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(new.template_id)
    .bind(status)
    .bind(Json(&new.variables))
    .bind(new.scheduled_at)
    .bind(actor.user_id)
    .fetch_one(&mut *tx)
    .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO waba_campaign_recipients (campaign_id, client_id, phone)
        SELECT $1, c.id, NULLIF(c.whatsapp_phone, '')
        FROM clients c
        WHERE c.id = ANY($2) AND c.deleted_at IS NULL
        ON CONFLICT (campaign_id, client_id) DO NOTHING
        "#,
    )
    .bind(campaign_id)
    .bind(&new.client_ids)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Err(ApiError::Validation("None of the clients exist".into()));
    }

    sqlx::query("UPDATE waba_campaigns SET total_recipients = $2 WHERE id = $1")
        .bind(campaign_id)
        .bind(inserted as i32)
        .execute(&mut *tx)
        .await?;

    let campaign = fetch_campaign(&mut tx, campaign_id).await?;
    tx.commit().await?;

    tracing::info!(
        campaign_id = %campaign.id,
        template_id = %campaign.template_id,
        recipients = campaign.total_recipients,
        status = ?campaign.status,
        "Campaign created"
    );

    Ok(campaign)
}

// =============================================================================
// Delivery
// =============================================================================

/// Launch a draft or scheduled campaign now and deliver it
pub async fn launch(
    pool: &PgPool,
    whatsapp: &WhatsAppClient,
    campaign_id: Uuid,
) -> ApiResult<CampaignRow> {
    let mut tx = pool.begin().await?;

    let campaign = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {} FROM waba_campaigns WHERE id = $1 FOR UPDATE",
        CAMPAIGN_COLUMNS
    ))
    .bind(campaign_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::NotFound)?;

    if !campaign.status.can_launch() {
        return Err(ApiError::Conflict(
            "Only draft or scheduled campaigns can be launched".into(),
        ));
    }

    let template = fetch_template(&mut tx, campaign.template_id)
        .await?
        .ok_or_else(|| ApiError::Validation("Template does not exist".into()))?;
    if template.status != TemplateStatus::Approved {
        return Err(ApiError::Validation(
            "Template must be approved before launching".into(),
        ));
    }

    mark_running(&mut tx, campaign_id).await?;
    tx.commit().await?;

    deliver(pool, whatsapp, campaign_id, &template, &campaign.variables.0).await
}

async fn mark_running(conn: &mut PgConnection, campaign_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE waba_campaigns
        SET status = 'running', started_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(campaign_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Final status once every recipient has been attempted
pub fn final_status(sent: i64, failed: i64) -> CampaignStatus {
    if sent == 0 && failed > 0 {
        CampaignStatus::Failed
    } else {
        CampaignStatus::Completed
    }
}

#[derive(FromRow)]
struct PendingRecipient {
    id: Uuid,
    client_id: Uuid,
    phone: Option<String>,
}

async fn deliver(
    pool: &PgPool,
    whatsapp: &WhatsAppClient,
    campaign_id: Uuid,
    template: &TemplateForSend,
    variables: &[String],
) -> ApiResult<CampaignRow> {
    if let Err(e) = send_to_recipients(pool, whatsapp, campaign_id, template, variables).await {
        tracing::error!(campaign_id = %campaign_id, error = %e, "Campaign delivery interrupted");
    }

    // A running campaign is never claimed again, so it must always be closed
    if let Err(e) = finish(pool, campaign_id).await {
        tracing::error!(campaign_id = %campaign_id, error = %e, "Failed to finalize campaign");
        sqlx::query(
            r#"
            UPDATE waba_campaigns
            SET status = 'failed', finished_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(campaign_id)
        .execute(pool)
        .await?;
    }

    get_campaign(pool, campaign_id).await
}

async fn send_to_recipients(
    pool: &PgPool,
    whatsapp: &WhatsAppClient,
    campaign_id: Uuid,
    template: &TemplateForSend,
    variables: &[String],
) -> Result<(), sqlx::Error> {
    let content = render_template(&template.body, variables);

    let recipients = sqlx::query_as::<_, PendingRecipient>(
        r#"
        SELECT id, client_id, phone
        FROM waba_campaign_recipients
        WHERE campaign_id = $1 AND status = 'pending'
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;

    for recipient in recipients {
        let Some(phone) = recipient.phone.as_deref().filter(|p| !p.is_empty()) else {
            mark_recipient_failed(pool, recipient.id, "Client has no WhatsApp phone").await?;
            continue;
        };

        let error = match whatsapp
            .send_template(phone, &template.name, &template.language, variables)
            .await
        {
            Ok(sent) => record_sent(pool, &recipient, &content, &sent.external_id)
                .await
                .err()
                .map(|e| format!("Sent but not recorded: {}", e)),
            Err(e) => Some(e.to_string()),
        };

        if let Some(error) = error {
            tracing::warn!(
                campaign_id = %campaign_id,
                client_id = %recipient.client_id,
                error = %error,
                "Campaign message failed"
            );
            mark_recipient_failed(pool, recipient.id, &error).await?;
        }
    }

    Ok(())
}

async fn record_sent(
    pool: &PgPool,
    recipient: &PendingRecipient,
    content: &str,
    external_id: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let message_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO messages (client_id, channel, direction, content, external_id, status, is_read)
        VALUES ($1, 'whatsapp', 'outbound', $2, $3, 'sent', TRUE)
        RETURNING id
        "#,
    )
    .bind(recipient.client_id)
    .bind(content)
    .bind(external_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE waba_campaign_recipients
        SET status = 'sent', message_id = $2, sent_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(recipient.id)
    .bind(message_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Fail whatever is still pending, then store the counters and final status
async fn finish(pool: &PgPool, campaign_id: Uuid) -> Result<CampaignStatus, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE waba_campaign_recipients
        SET status = 'failed', error = 'Delivery interrupted'
        WHERE campaign_id = $1 AND status = 'pending'
        "#,
    )
    .bind(campaign_id)
    .execute(&mut *tx)
    .await?;

    let (sent, failed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FILTER (WHERE status = 'sent'),
               COUNT(*) FILTER (WHERE status = 'failed')
        FROM waba_campaign_recipients
        WHERE campaign_id = $1
        "#,
    )
    .bind(campaign_id)
    .fetch_one(&mut *tx)
    .await?;

    let status = final_status(sent, failed);
    sqlx::query(
        r#"
        UPDATE waba_campaigns
        SET status = $2, sent_count = $3, failed_count = $4, finished_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(campaign_id)
    .bind(status)
    .bind(sent as i32)
    .bind(failed as i32)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(campaign_id = %campaign_id, sent, failed, status = ?status, "Campaign delivered");
    Ok(status)
}

async fn mark_recipient_failed(
    pool: &PgPool,
    recipient_id: Uuid,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE waba_campaign_recipients SET status = 'failed', error = $2 WHERE id = $1")
        .bind(recipient_id)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deliver every scheduled campaign whose time has come.
///
/// Each campaign is claimed with `FOR UPDATE SKIP LOCKED`, so several
/// workers never deliver the same campaign.
pub async fn dispatch_due(pool: &PgPool, whatsapp: &WhatsAppClient) -> ApiResult<usize> {
    let mut delivered = 0;

    loop {
        let mut tx = pool.begin().await?;

        let claimed: Option<(Uuid, Uuid, Json<Vec<String>>)> = sqlx::query_as(
            r#"
            SELECT id, template_id, variables
            FROM waba_campaigns
            WHERE status = 'scheduled' AND scheduled_at <= NOW()
            ORDER BY scheduled_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((campaign_id, template_id, variables)) = claimed else {
            tx.commit().await?;
            break;
        };

        let template = fetch_template(&mut tx, template_id)
            .await?
            .filter(|t| t.status == TemplateStatus::Approved);

        let Some(template) = template else {
            sqlx::query(
                r#"
                UPDATE waba_campaigns
                SET status = 'failed', finished_at = NOW(), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::warn!(campaign_id = %campaign_id, "Scheduled campaign failed: template not approved");
            continue;
        };

        mark_running(&mut tx, campaign_id).await?;
        tx.commit().await?;

        deliver(pool, whatsapp, campaign_id, &template, &variables.0).await?;
        delivered += 1;
    }

    Ok(delivered)
}

/// Cancel a campaign that has not started
pub async fn cancel(pool: &PgPool, campaign_id: Uuid) -> ApiResult<CampaignRow> {
    let updated = sqlx::query_as::<_, CampaignRow>(&format!(
        r#"
        UPDATE waba_campaigns
        SET status = 'cancelled', updated_at = NOW()
        WHERE id = $1 AND status IN ('draft', 'scheduled')
        RETURNING {}
        "#,
        CAMPAIGN_COLUMNS
    ))
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(campaign) => {
            tracing::info!(campaign_id = %campaign_id, "Campaign cancelled");
            Ok(campaign)
        }
        None => {
            // Distinguish a missing campaign from one that already ran
            get_campaign(pool, campaign_id).await?;
            Err(ApiError::Conflict(
                "Only draft or scheduled campaigns can be cancelled".into(),
            ))
        }
    }
}

pub async fn recipients(pool: &PgPool, campaign_id: Uuid) -> ApiResult<Vec<RecipientRow>> {
    let rows = sqlx::query_as::<_, RecipientRow>(
        r#"
        SELECT id, client_id, phone, status, message_id, error, sent_at
        FROM waba_campaign_recipients
        WHERE campaign_id = $1
        ORDER BY status, sent_at NULLS LAST
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_status() {
        assert_eq!(final_status(10, 0), CampaignStatus::Completed);
        assert_eq!(final_status(9, 1), CampaignStatus::Completed);
        assert_eq!(final_status(0, 3), CampaignStatus::Failed);
    }
}
