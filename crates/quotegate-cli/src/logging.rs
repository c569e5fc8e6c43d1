//! Subscriber setup: `RUST_LOG` wins, then `--log-level`, then `[logging]`.

use quotegate_core::LoggingConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

pub fn init(cli: &Cli, config: &LoggingConfig) -> Result<(), CliError> {
    let fallback = cli.log_level.as_deref().unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|error| CliError::Logging(error.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if cli.log_json || config.json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
    installed.map_err(|error| CliError::Logging(error.to_string()))
}
