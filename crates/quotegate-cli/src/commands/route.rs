use quotegate_core::{Gateway, GatewayConfig, Symbol};
use serde_json::Value;
use tracing::warn;

use crate::cli::RouteArgs;
use crate::error::CliError;

/// Health starts unknown, so every enabled provider is probed once before ranking.
pub async fn run(args: &RouteArgs, config: GatewayConfig) -> Result<Value, CliError> {
    let symbol = Symbol::parse(&args.symbol)?;
    let gateway = Gateway::builder(config).build()?;

    let providers: Vec<_> = gateway
        .registry()
        .enabled()
        .map(|descriptor| descriptor.id.clone())
        .collect();
    for provider in &providers {
        let health = gateway.check_provider(provider).await?;
        if !health.is_healthy() {
            warn!(provider = %provider, status = ?health.status, "provider unhealthy after probe");
        }
    }

    let recommendation =
        gateway.routing_recommendations(&symbol, args.data_type, &args.region.to_ascii_uppercase());
    Ok(serde_json::to_value(recommendation)?)
}
