use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use ci_admission::config::AppConfig;
use ci_admission::db::Database;
use ci_admission::quota::usage;
use ci_admission::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_json);

    info!("Starting ci-admission v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    let scheduler = Scheduler::new();
    if let Err(e) = scheduler.reload_settings(&db).await {
        warn!("Failed to load admission settings from DB: {e}");
    }

    // Log drop events for operators
    {
        let mut rx = scheduler.drops().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => info!(
                        pipeline = event.pipeline_id,
                        builds = ?event.build_ids,
                        reason = event.reason.as_str(),
                        "Builds dropped"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Drop event listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Periodic settings refresh and monthly usage reset
    {
        let db = db.clone();
        let sched = scheduler.clone();
        let period = Duration::from_secs(config.usage_reset_check_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = sched.reload_settings(&db).await {
                    warn!("Failed to reload admission settings: {e}");
                }
                let default_limit = sched.settings().await.default_minutes_limit;
                if let Err(e) = usage::reset_monthly_usage(&db, Utc::now(), default_limit).await {
                    error!(error = %e, "Monthly usage reset failed");
                }
            }
        });
    }

    info!(
        reset_check_secs = config.usage_reset_check_secs,
        "Admission service running"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ci_admission=info".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
