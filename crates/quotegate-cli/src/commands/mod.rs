mod config;
mod fetch;
mod route;
mod serve;

use quotegate_core::GatewayConfig;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// The file named by `--config`, or the built-in defaults.
pub fn load_config(cli: &Cli) -> Result<GatewayConfig, CliError> {
    match &cli.config {
        Some(path) => Ok(GatewayConfig::load(path)?),
        None => Ok(GatewayConfig::default()),
    }
}

/// Runs the selected command. `Some` output is printed as JSON.
pub async fn run(cli: &Cli, config: GatewayConfig) -> Result<Option<Value>, CliError> {
    match &cli.command {
        Command::Serve => serve::run(config).await.map(|()| None),
        Command::Fetch(args) => fetch::run(args, config).await.map(Some),
        Command::Route(args) => route::run(args, config).await.map(Some),
        Command::Config(args) => config::run(args, &config),
    }
}
