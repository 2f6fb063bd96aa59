//! # Nightly Report Demo
//!
//! Recurring jobs: register a cron series idempotently (re-running this
//! demo never duplicates it), watch it fire, and stop gracefully on
//! ctrl-c.
//!
//! The "nightly" report is scheduled every minute here so there is
//! something to watch.
//!
//! ```sh
//! MONGODB_URI=mongodb://localhost:27017 cargo run -p nightly-report-demo
//! ```

use std::time::Duration;

use anyhow::Result;
use monque::{Monque, MonqueOptions, RetentionPolicy, ScheduleOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportParams {
    include_signups: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,monque=debug".into()),
        )
        .init();

    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let client = mongodb::Client::with_uri_str(&uri).await?;

    let monque = Monque::new(
        client.database("monque_demo"),
        MonqueOptions {
            poll_interval: Duration::from_millis(500),
            // Keep the demo collection from growing forever.
            job_retention: Some(RetentionPolicy {
                completed: Some(Duration::from_secs(600)),
                failed: Some(Duration::from_secs(3600)),
                interval: Duration::from_secs(60),
            }),
            ..Default::default()
        },
    );
    monque.initialize().await?;

    monque.worker("nightly-report", |params: ReportParams, ctx| async move {
        info!(
            job_id = %ctx.job().id,
            include_signups = params.include_signups,
            "compiling report"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("report delivered");
        Ok(())
    })?;

    monque.start();

    // Safe to call on every boot: the unique key is derived from
    // (name, cron), so the series exists exactly once.
    let series = monque
        .schedule(
            "* * * * *",
            "nightly-report",
            ReportParams {
                include_signups: true,
            },
            ScheduleOptions::default(),
        )
        .await?;
    info!(
        job_id = %series.id,
        next_run_at = %series.next_run_at,
        "report series registered"
    );

    info!("running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    monque.stop(Some(Duration::from_secs(10))).await?;
    info!("stopped cleanly");
    Ok(())
}
