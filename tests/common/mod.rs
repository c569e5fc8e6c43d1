//! Shared fixtures for the behavior tests: a scripted transport and a small
//! two-provider deployment that speaks the generic OHLCV JSON format.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use quotegate_core::http_client::HttpFuture;
use quotegate_core::{
    FixedSession, Gateway, GatewayConfig, HttpClient, HttpError, HttpRequest, HttpResponse,
};

pub const ALPHA: &str = "http://alpha.test";
pub const BETA: &str = "http://beta.test";

type Scripted = Result<HttpResponse, HttpError>;

#[derive(Debug, Default)]
struct Route {
    queued: VecDeque<Scripted>,
    fallback: Option<Scripted>,
}

/// Answers requests by URL prefix. Queued answers are used first, then the
/// route's fallback; unknown prefixes get a 404.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, prefix: &str, answer: Scripted) -> &Self {
        self.routes
            .lock()
            .expect("routes lock is not poisoned")
            .entry(prefix.to_owned())
            .or_default()
            .queued
            .push_back(answer);
        self
    }

    pub fn always(&self, prefix: &str, answer: Scripted) -> &Self {
        self.routes
            .lock()
            .expect("routes lock is not poisoned")
            .entry(prefix.to_owned())
            .or_default()
            .fallback = Some(answer);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock is not poisoned").clone()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock is not poisoned")
            .iter()
            .filter(|url| url.starts_with(prefix))
            .count()
    }

    fn answer(&self, url: &str) -> Scripted {
        let mut routes = self.routes.lock().expect("routes lock is not poisoned");
        let route = routes
            .iter_mut()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, route)| route);
        match route {
            Some(route) => route
                .queued
                .pop_front()
                .or_else(|| route.fallback.clone())
                .unwrap_or_else(|| Ok(HttpResponse::with_status(404, ""))),
            None => Ok(HttpResponse::with_status(404, "")),
        }
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute(&self, request: HttpRequest) -> HttpFuture<'_> {
        self.calls
            .lock()
            .expect("calls lock is not poisoned")
            .push(request.url.clone());
        let answer = self.answer(&request.url);
        Box::pin(async move { answer })
    }
}

/// One daily bar for `symbol` in the generic OHLCV layout.
pub fn bars(symbol: &str) -> Scripted {
    Ok(HttpResponse::ok_json(format!(
        r#"[{{"symbol":"{symbol}","timestamp":"2024-01-02T21:00:00Z","open":185.0,"high":188.4,"low":183.9,"close":187.2,"volume":52000000}}]"#
    )))
}

pub fn server_error() -> Scripted {
    Ok(HttpResponse::with_status(503, "unavailable"))
}

pub fn empty() -> Scripted {
    Ok(HttpResponse::ok_json("[]"))
}

/// Two providers, alpha before beta, generous rate limits and one worker.
pub fn two_provider_config() -> GatewayConfig {
    GatewayConfig::from_toml_str(&format!(
        r#"
[queue]
workers = 1
max_retries = 3

[[providers]]
id = "alpha"
base_url = "{ALPHA}"
url_template = "{{base_url}}/bars/{{symbol}}?type={{data_type}}"
priority = 1
cost_per_request = 0.001
rate_limit = {{ requests_per_second = 100.0, burst = 100 }}
circuit_breaker = {{ failure_rate_threshold = 50.0, sliding_window_size = 4, minimum_number_of_calls = 4, wait_duration_in_open_state_ms = 30000, permitted_calls_in_half_open_state = 1 }}
coverage = ["US"]

[[providers]]
id = "beta"
base_url = "{BETA}"
url_template = "{{base_url}}/bars/{{symbol}}?type={{data_type}}"
priority = 2
cost_per_request = 0.004
rate_limit = {{ requests_per_second = 100.0, burst = 100 }}
coverage = ["US", "EU"]
"#
    ))
    .expect("fixture config is valid")
}

pub fn gateway(config: GatewayConfig, http: Arc<ScriptedHttpClient>, market_open: bool) -> Arc<Gateway> {
    Gateway::builder(config)
        .with_http_client(http)
        .with_session(Arc::new(FixedSession(market_open)))
        .build()
        .expect("gateway builds")
}
