//! LineDesk background worker
//!
//! Runs on a cron schedule:
//! - every minute: due scheduled reports, due campaigns, due task reminders
//! - daily at 03:00 UTC: notification and session cleanup

mod jobs;

use std::{future::Future, sync::Arc};

use linedesk_api::{channels::ChannelRegistry, email::ReportMailer, Config};
use linedesk_shared::create_pool;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVERY_MINUTE: &str = "0 * * * * *";
const DAILY_AT_3AM: &str = "0 0 3 * * *";

struct WorkerContext {
    pool: PgPool,
    channels: ChannelRegistry,
    mailer: ReportMailer,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("linedesk_worker=debug,linedesk_api=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Log a failed job run; the schedule keeps going
async fn run_logged<F, T>(name: &'static str, job: F)
where
    F: Future<Output = anyhow::Result<T>>,
{
    if let Err(e) = job.await {
        tracing::error!(job = name, error = %e, "Job failed");
    }
}

fn minutely_job(ctx: Arc<WorkerContext>) -> anyhow::Result<Job> {
    Ok(Job::new_async(EVERY_MINUTE, move |_id, _scheduler| {
        let ctx = ctx.clone();
        Box::pin(async move {
            run_logged("reports", jobs::run_due_reports(&ctx.pool, &ctx.mailer)).await;
            run_logged(
                "campaigns",
                jobs::dispatch_due_campaigns(&ctx.pool, &ctx.channels.whatsapp),
            )
            .await;
            run_logged("task_reminders", jobs::notify_due_tasks(&ctx.pool)).await;
        })
    })?)
}

fn daily_job(ctx: Arc<WorkerContext>) -> anyhow::Result<Job> {
    Ok(Job::new_async(DAILY_AT_3AM, move |_id, _scheduler| {
        let ctx = ctx.clone();
        Box::pin(async move {
            run_logged(
                "notification_cleanup",
                jobs::cleanup_notifications(&ctx.pool, jobs::NOTIFICATION_RETENTION_DAYS),
            )
            .await;
            run_logged("session_cleanup", jobs::cleanup_sessions(&ctx.pool)).await;
        })
    })?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, 5).await?;

    let ctx = Arc::new(WorkerContext {
        pool,
        channels: ChannelRegistry::from_config(&config),
        mailer: ReportMailer::from_config(&config),
    });
    if !ctx.mailer.is_enabled() {
        tracing::warn!("RESEND_API_KEY not set, scheduled reports will be stored but not e-mailed");
    }

    let mut scheduler = JobScheduler::new().await?;
    scheduler.add(minutely_job(ctx.clone())?).await?;
    scheduler.add(daily_job(ctx.clone())?).await?;
    scheduler.start().await?;
    tracing::info!("LineDesk worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}
