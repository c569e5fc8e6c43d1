use std::time::Duration;

use quotegate_core::{Caller, Gateway, GatewayConfig, GatewayResponse, Symbol, WorkItem};
use serde::Serialize;
use serde_json::Value;

use crate::cli::FetchArgs;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct FetchOutput {
    id: String,
    symbol: String,
    data_type: String,
    priority: String,
    estimated_wait_ms: u64,
    #[serde(flatten)]
    response: ResponseBody,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ResponseBody {
    Data { payload: Value },
    NoContent,
    Cancelled,
}

pub async fn run(args: &FetchArgs, config: GatewayConfig) -> Result<Value, CliError> {
    let symbol = Symbol::parse(&args.symbol)?;
    let gateway = Gateway::builder(config).build()?;
    gateway.start_workers();

    let item = WorkItem::new(symbol.clone(), args.data_type, args.priority, Caller::system())
        .with_region(&args.region);
    let submission = gateway.submit_item(item)?;
    let id = submission.id;
    let estimated_wait_ms = u64::try_from(submission.estimated_wait.as_millis()).unwrap_or(u64::MAX);

    let waited = tokio::time::timeout(Duration::from_millis(args.timeout_ms), submission.wait()).await;
    let outcome = match waited {
        Ok(result) => result,
        Err(_) => {
            gateway.cancel(id);
            gateway.shutdown().await;
            return Err(CliError::Timeout {
                timeout_ms: args.timeout_ms,
            });
        }
    };
    gateway.shutdown().await;

    let response = match outcome? {
        GatewayResponse::Data(payload) => ResponseBody::Data {
            payload: serde_json::to_value(payload.as_ref())?,
        },
        GatewayResponse::NoContent => ResponseBody::NoContent,
        GatewayResponse::Cancelled => ResponseBody::Cancelled,
    };

    Ok(serde_json::to_value(FetchOutput {
        id: id.to_string(),
        symbol: symbol.to_string(),
        data_type: args.data_type.to_string(),
        priority: args.priority.to_string(),
        estimated_wait_ms,
        response,
    })?)
}
