//! CLI argument definitions for quotegate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serve` | Run the gateway until Ctrl-C |
//! | `fetch` | Submit one request and print the response |
//! | `route` | Print provider routing recommendations |
//! | `config` | Validate or print the effective configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | TOML configuration file |
//! | `--log-level` | from config | Filter used when `RUST_LOG` is unset |
//! | `--log-json` | `false` | Emit logs as JSON lines |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! quotegate serve --config gateway.toml
//! quotegate fetch AAPL --data-type real-time --priority high --pretty
//! quotegate route MSFT --data-type fundamentals --region EU
//! quotegate config show
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use quotegate_core::{DataType, Priority, DEFAULT_REGION};

/// Priority-aware gateway for rate-limited market data providers.
#[derive(Debug, Parser)]
#[command(
    name = "quotegate",
    author,
    version,
    about = "Priority-aware gateway for rate-limited market data providers",
    long_about = "quotegate admits market data requests into a three-lane priority queue, \
routes them to the best healthy provider, and protects each provider with a rate limiter \
and a circuit breaker. Responses are cached with market-hours-aware expiry.\n\
\n\
Use 'quotegate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "quotegate_core=trace").
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start workers and background tasks and run until Ctrl-C.
    ///
    /// A snapshot of queue, limiter, breaker, cache and health state is
    /// logged on exit.
    Serve,

    /// Submit one request through the queue and print the response.
    ///
    /// # Examples
    ///
    ///   quotegate fetch AAPL
    ///   quotegate fetch TSLA --data-type real-time --priority high
    Fetch(FetchArgs),

    /// Probe every enabled provider once and print routing recommendations.
    ///
    /// # Examples
    ///
    ///   quotegate route AAPL --data-type real-time
    ///   quotegate route SAP --region EU
    Route(RouteArgs),

    /// Configuration commands.
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Market symbol (e.g., AAPL).
    pub symbol: String,

    /// Data type: real-time, price, fundamentals, technical, news, historical, options, volume.
    #[arg(long, default_value_t = DataType::Price)]
    pub data_type: DataType,

    /// Admission lane: high, medium or low.
    #[arg(long, default_value_t = Priority::Medium)]
    pub priority: Priority,

    /// Region code used for provider coverage scoring.
    #[arg(long, default_value = DEFAULT_REGION)]
    pub region: String,

    /// Give up waiting after this many milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct RouteArgs {
    /// Market symbol (e.g., AAPL).
    pub symbol: String,

    #[arg(long, default_value_t = DataType::Price)]
    pub data_type: DataType,

    #[arg(long, default_value = DEFAULT_REGION)]
    pub region: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load and validate the configuration, then report provider counts.
    Check,
    /// Print the effective configuration as TOML.
    Show,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fetch_parses_data_type_and_priority() {
        let cli = Cli::try_parse_from([
            "quotegate",
            "fetch",
            "AAPL",
            "--data-type",
            "real-time",
            "--priority",
            "high",
        ])
        .expect("valid arguments");

        match cli.command {
            Command::Fetch(args) => {
                assert_eq!(args.symbol, "AAPL");
                assert_eq!(args.data_type, DataType::RealTime);
                assert_eq!(args.priority, Priority::High);
                assert_eq!(args.region, "US");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_priority_is_rejected() {
        let parsed = Cli::try_parse_from(["quotegate", "fetch", "AAPL", "--priority", "urgent"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_options_follow_subcommands() {
        let cli = Cli::try_parse_from(["quotegate", "config", "show", "--config", "gw.toml", "--log-json"])
            .expect("valid arguments");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("gw.toml")));
        assert!(cli.log_json);
        assert!(matches!(
            cli.command,
            Command::Config(ConfigArgs {
                command: ConfigCommand::Show
            })
        ));
    }
}
