use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] quotegate_core::ValidationError),

    #[error(transparent)]
    Config(#[from] quotegate_core::ConfigError),

    #[error("{}: {source}", .source.code())]
    Gateway {
        #[from]
        source: quotegate_core::GatewayError,
    },

    #[error("no response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to initialise logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Config(_) => 2,
            Self::Gateway { .. } => 3,
            Self::Timeout { .. } => 3,
            Self::Serialization(_) => 4,
            Self::Logging(_) => 5,
            Self::Io(_) => 10,
        }
    }
}
