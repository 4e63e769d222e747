use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tabula_coordination::CoordinationService;

use crate::config::{ConfigArgs, ServerConfig};
use crate::error::ServerError;

pub async fn run(args: ConfigArgs) -> Result<(), ServerError> {
    tracing::info!("tabula-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(config = %args.config, "loaded config");
    for (id, destination) in &config.destinations {
        tracing::info!(
            destination = %id,
            schema = %destination.schema,
            primary_key = ?destination.primary_key_fields,
            max_columns = destination.max_columns,
            "destination configured"
        );
    }

    // --- Coordination ---
    let instance_id = config.instance_id();
    let coordination = tabula_coordination::connect(&config.coordination, instance_id).await?;

    let token = CancellationToken::new();
    let reporter = tokio::spawn(report_instances(
        coordination.clone(),
        Duration::from_secs(config.report_interval_secs),
        token.clone(),
    ));

    tracing::info!(instance = %coordination.instance_id(), "server ready");

    // --- Wait for Ctrl+C ---
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    token.cancel();
    let _ = reporter.await;
    coordination.close().await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn report_instances(coordination: Arc<dyn CoordinationService>, interval: Duration, token: CancellationToken) {
    loop {
        match coordination.get_instances().await {
            Ok(instances) => tracing::info!(count = instances.len(), ?instances, "live instances"),
            Err(e) => tracing::warn!(error = %e, "failed to list instances"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => return,
        }
    }
}
