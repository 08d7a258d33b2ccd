mod services;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use ticketflow_infra::{ServiceConfig, TicketService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    ticketflow_observability::init(config.log_format);

    let services = services::build_services(&config).await?;
    let stats = services.service.analytics().await?;
    tracing::info!(
        persistent = config.use_persistent_stores,
        total_tickets = stats.total_tickets,
        given_tickets = stats.given_tickets,
        "ticketflow worker starting"
    );

    let handle = services
        .pool
        .spawn(services.jobs.clone(), config.executor_config());
    let analytics = spawn_analytics(services.service.clone(), config.analytics_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining in-flight jobs");
    if let Some(task) = analytics {
        task.abort();
    }
    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        dead_lettered = stats.jobs_dead_lettered,
        "worker stopped"
    );
    Ok(())
}

/// Save an analytics snapshot every `interval`, starting now.
fn spawn_analytics(service: TicketService, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("analytics snapshots disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = service.save_analytics().await {
                tracing::warn!(error = %e, "analytics snapshot failed");
            }
        }
    }))
}
