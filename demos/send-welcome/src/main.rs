//! # Send Welcome Demo
//!
//! One-shot jobs end to end: enqueue, claim, a deliberately failing
//! first attempt, exponential backoff retry, and the event stream.
//!
//! Run against a local MongoDB:
//!
//! ```sh
//! MONGODB_URI=mongodb://localhost:27017 cargo run -p send-welcome-demo
//! ```

use std::time::Duration;

use anyhow::{bail, Result};
use monque::{EnqueueOptions, Monque, MonqueOptions, SchedulerEvent};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WelcomeEmail {
    to: String,
    display_name: String,
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
            poll_interval: Duration::from_millis(250),
            base_retry_interval: Duration::from_millis(500),
            ..Default::default()
        },
    );
    monque.initialize().await?;

    // The first attempt fails on purpose so the retry path is visible.
    monque.worker("send-welcome", |email: WelcomeEmail, ctx| async move {
        if ctx.job().fail_count == 0 {
            bail!("smtp connection refused (simulated)");
        }
        info!(to = %email.to, "welcome email sent to {}", email.display_name);
        Ok(())
    })?;

    let mut events = monque.subscribe();
    monque.start();

    let job = monque
        .enqueue(
            "send-welcome",
            WelcomeEmail {
                to: "ada@example.com".to_string(),
                display_name: "Ada".to_string(),
            },
            EnqueueOptions {
                unique_key: Some("welcome:ada@example.com".to_string()),
                ..Default::default()
            },
        )
        .await?;
    info!(job_id = %job.id, "enqueued welcome email");

    // Watch the attempt fail, retry, and complete.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv()).await??;
        info!(kind = event.kind(), "event");
        match event {
            SchedulerEvent::JobCompleted { job_id, .. } if job_id == job.id => break,
            SchedulerEvent::JobFailed { job_id, reason, .. } if job_id == job.id => {
                bail!("welcome email terminally failed: {reason}");
            }
            _ => {}
        }
    }

    monque.stop(None).await?;
    Ok(())
}
