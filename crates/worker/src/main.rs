use anyhow::Context;

use taskforge_infra::config::SchedulerConfig;
use taskforge_worker::services::Services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    tracing::info!(?config, "starting taskforge worker");

    let services = Services::start(config).context("failed to start background services")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let stats = services.shutdown().await;
    tracing::info!(
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "worker stopped"
    );
    Ok(())
}
