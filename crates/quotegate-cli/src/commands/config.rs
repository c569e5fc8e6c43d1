use quotegate_core::GatewayConfig;
use serde_json::{json, Value};

use crate::cli::{ConfigArgs, ConfigCommand};
use crate::error::CliError;

pub fn run(args: &ConfigArgs, config: &GatewayConfig) -> Result<Option<Value>, CliError> {
    match args.command {
        ConfigCommand::Check => {
            config.validate()?;
            let enabled = config.providers.iter().filter(|provider| provider.enabled).count();
            Ok(Some(json!({
                "valid": true,
                "providers": config.providers.len(),
                "enabled_providers": enabled,
                "workers": config.queue.workers,
            })))
        }
        ConfigCommand::Show => {
            print!("{}", config.to_toml()?);
            Ok(None)
        }
    }
}
