use quotegate_core::{Gateway, GatewayConfig};
use tracing::{info, warn};

use crate::error::CliError;

pub async fn run(config: GatewayConfig) -> Result<(), CliError> {
    let gateway = Gateway::builder(config).build()?;
    gateway.start();
    info!(providers = gateway.registry().enabled().count(), "gateway serving, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    for alert in gateway.alerts() {
        warn!(alert = %alert, "active alert at shutdown");
    }
    let snapshot = serde_json::to_string(&gateway.snapshot())?;
    info!(snapshot = %snapshot, "final gateway snapshot");

    gateway.shutdown().await;
    Ok(())
}
