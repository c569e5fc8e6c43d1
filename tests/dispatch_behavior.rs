//! Behavior-driven tests for request dispatch
//!
//! These tests verify HOW the gateway walks its candidate providers: circuit
//! breakers and rate limits skip providers without a network call, failures
//! fall through to the next provider, exhausted requests retry with backoff
//! and finally land in the dead-letter lane, and stale cache is the last resort.

mod common;

use std::time::Duration;

use quotegate_core::{
    AttemptOutcome, Caller, CircuitState, DataType, Fetched, GatewayConfig, GatewayError,
    GatewayResponse, Priority, ProviderId, SkipReason, Symbol, WorkItem,
};

use common::{bars, empty, gateway, server_error, two_provider_config, ScriptedHttpClient, ALPHA, BETA};

fn aapl() -> Symbol {
    Symbol::parse("AAPL").expect("valid symbol")
}

fn alpha() -> ProviderId {
    ProviderId::parse("alpha").expect("valid provider id")
}

fn beta() -> ProviderId {
    ProviderId::parse("beta").expect("valid provider id")
}

// =============================================================================
// Dispatch: Circuit breaking
// =============================================================================

#[tokio::test]
async fn when_half_the_window_fails_the_breaker_opens_and_calls_stop() {
    // Given: alpha's breaker evaluates a window of 4 calls at a 50% threshold
    let http = ScriptedHttpClient::new();
    http.push(ALPHA, bars("AAPL"))
        .push(ALPHA, bars("AAPL"))
        .push(ALPHA, server_error())
        .push(ALPHA, server_error());
    let gateway = gateway(two_provider_config(), http.clone(), true);

    // When: Two calls succeed and two fail
    for expected_success in [true, true, false, false] {
        let outcome = gateway.attempt_provider(&alpha(), &aapl(), DataType::Price).await;
        assert_eq!(
            matches!(outcome, AttemptOutcome::Success(_)),
            expected_success,
            "unexpected outcome {outcome:?}"
        );
    }

    // Then: The breaker is open and the next attempt is skipped without a network call
    let outcome = gateway.attempt_provider(&alpha(), &aapl(), DataType::Price).await;
    assert!(matches!(outcome, AttemptOutcome::Skipped(SkipReason::CircuitOpen)));
    assert_eq!(http.calls_to(ALPHA), 4);

    let snapshot = gateway.snapshot();
    let breaker = &snapshot.circuit_breakers[&alpha()];
    assert_eq!(breaker.state, CircuitState::Open);
    assert_eq!(breaker.failure_rate, Some(50.0));
    assert!(gateway
        .alerts()
        .iter()
        .any(|alert| alert.contains("alpha")));
}

#[tokio::test]
async fn when_only_open_circuits_remain_the_caller_sees_circuit_open() {
    // Given: A single-provider deployment whose breaker trips after one failure
    let mut config = two_provider_config();
    config.providers.truncate(1);
    config.providers[0].circuit_breaker.sliding_window_size = 1;
    config.providers[0].circuit_breaker.minimum_number_of_calls = 1;
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, server_error());
    let gateway = gateway(config, http.clone(), true);
    let _ = gateway.attempt_provider(&alpha(), &aapl(), DataType::Price).await;

    // When: A request is processed
    let mut item = WorkItem::new(aapl(), DataType::Price, Priority::High, Caller::system());
    let result = gateway.process(&mut item).await;

    // Then: The single skip reason is surfaced and no further call is made
    assert_eq!(result, Err(GatewayError::CircuitOpen { provider: alpha() }));
    assert_eq!(http.calls_to(ALPHA), 1);
}

// =============================================================================
// Dispatch: Rate limits
// =============================================================================

#[tokio::test]
async fn when_a_provider_has_no_budget_it_is_skipped_not_failed() {
    // Given: Both providers are known healthy, alpha ranks first but allows a single request
    let mut config = two_provider_config();
    config.providers[0].rate_limit.requests_per_second = 0.01;
    config.providers[0].rate_limit.burst = 1;
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, bars("AAPL")).always(BETA, bars("AAPL"));
    let gateway = gateway(config, http.clone(), true);
    gateway.health().record_success(&alpha(), Duration::from_millis(40));
    gateway.health().record_success(&beta(), Duration::from_millis(40));

    // When: Two requests are processed back to back
    let mut first = WorkItem::new(aapl(), DataType::Price, Priority::High, Caller::system());
    let mut second = WorkItem::new(aapl(), DataType::Technical, Priority::High, Caller::system());
    gateway.process(&mut first).await.expect("first request served");
    gateway.process(&mut second).await.expect("second request served");

    // Then: The second went to beta and alpha's breaker saw no failure
    assert_eq!(first.provider, Some(alpha()));
    assert_eq!(second.provider, Some(beta()));
    assert_eq!(http.calls_to(ALPHA), 1);
    let breaker = &gateway.snapshot().circuit_breakers[&alpha()];
    assert_eq!(breaker.failed_calls, 0);
}

// =============================================================================
// Dispatch: Failover
// =============================================================================

#[tokio::test]
async fn when_the_first_provider_fails_the_next_one_serves_the_request() {
    // Given: alpha is down and beta answers
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, server_error()).always(BETA, bars("AAPL"));
    let gateway = gateway(two_provider_config(), http.clone(), true);
    gateway.start_workers();

    // When: A request is submitted
    let submission = gateway
        .submit(aapl(), DataType::Price, Priority::High)
        .expect("admitted");
    let response = submission.wait().await.expect("served");

    // Then: beta's data is returned and cached, and both providers' health moved
    let GatewayResponse::Data(payload) = response else {
        panic!("expected data, got {response:?}");
    };
    assert_eq!(payload.provider, beta());
    assert_eq!(payload.bars.len(), 1);
    assert!(gateway.cache().get(&aapl(), DataType::Price).is_some());

    let alpha_health = gateway.health().health(&alpha()).expect("monitored");
    let beta_health = gateway.health().health(&beta()).expect("monitored");
    assert_eq!(alpha_health.failed_requests, 1);
    assert_eq!(beta_health.successful_requests, 1);
    assert!((beta_health.total_cost - 0.004).abs() < 1e-12);

    gateway.shutdown().await;
}

#[tokio::test]
async fn parse_failures_count_as_upstream_failures() {
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, Ok(quotegate_core::HttpResponse::ok_json("{\"unexpected\": true")));
    let gateway = gateway(two_provider_config(), http, true);

    let outcome = gateway.attempt_provider(&alpha(), &aapl(), DataType::Price).await;

    assert!(matches!(outcome, AttemptOutcome::Failed(_)));
    let health = gateway.health().health(&alpha()).expect("monitored");
    assert_eq!(health.failed_requests, 1);
}

#[tokio::test]
async fn an_empty_answer_is_served_as_no_content() {
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, empty());
    let gateway = gateway(two_provider_config(), http.clone(), true);

    let outcome = gateway.attempt_provider(&alpha(), &aapl(), DataType::News).await;
    assert!(matches!(outcome, AttemptOutcome::Success(Fetched::NoContent)));

    let mut item = WorkItem::new(aapl(), DataType::News, Priority::Low, Caller::system());
    assert_eq!(gateway.process(&mut item).await, Ok(GatewayResponse::NoContent));
    assert_eq!(http.calls_to(BETA), 0);
    assert!(gateway.cache().is_empty());
}

// =============================================================================
// Dispatch: Retries and dead letters
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_every_provider_keeps_failing_the_request_is_dead_lettered() {
    // Given: Both providers fail every call and the queue allows 3 attempts
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, server_error()).always(BETA, server_error());
    let gateway = gateway(two_provider_config(), http.clone(), true);
    gateway.start_workers();

    // When: A request is submitted and the backoff timers elapse
    let submission = gateway
        .submit(aapl(), DataType::Price, Priority::Medium)
        .expect("admitted");
    let id = submission.id;
    let result = submission.wait().await;

    // Then: The caller gets a final error and the item is inspectable
    match result {
        Err(GatewayError::RetriesExhausted { id: failed, attempts, .. }) => {
            assert_eq!(failed, id);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
    assert_eq!(http.calls_to(ALPHA), 3);
    assert_eq!(http.calls_to(BETA), 3);

    let dead = gateway.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert!(dead[0]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("all providers exhausted")));

    let stats = gateway.queue().stats();
    assert_eq!((stats.failed, stats.dead_letter), (1, 1));
    assert!(gateway
        .alerts()
        .iter()
        .any(|alert| alert.contains("dead-letter")));

    // And: Only an admin may clear the lane
    assert!(gateway.clear_dead_letters(&Caller::system()).is_err());
    let admin = Caller::new("ops", quotegate_core::Role::Admin);
    assert_eq!(gateway.clear_dead_letters(&admin), Ok(1));

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_request_that_recovers_before_its_last_attempt_completes() {
    // Given: Both providers fail twice, then alpha answers; 3 attempts are allowed
    let http = ScriptedHttpClient::new();
    http.push(ALPHA, server_error())
        .push(ALPHA, server_error())
        .always(ALPHA, bars("AAPL"))
        .always(BETA, server_error());
    let gateway = gateway(two_provider_config(), http.clone(), true);
    gateway.start_workers();

    // When: The request is submitted and two backoff delays elapse
    let submission = gateway
        .submit(aapl(), DataType::Price, Priority::High)
        .expect("admitted");
    let result = submission.wait().await;

    // Then: The third attempt is served by alpha
    match result {
        Ok(GatewayResponse::Data(payload)) => assert_eq!(payload.provider, alpha()),
        other => panic!("expected data, got {other:?}"),
    }
    assert_eq!(http.calls_to(ALPHA), 3);
    assert_eq!(http.calls_to(BETA), 2);

    // And: Nothing was dead-lettered and the request counts as completed
    assert!(gateway.dead_letters().is_empty());
    let stats = gateway.queue().stats();
    assert_eq!((stats.total, stats.completed, stats.failed), (1, 1, 0));
    assert_eq!(stats.dead_letter, 0);
    assert!(!gateway.alerts().iter().any(|alert| alert.contains("dead-letter")));

    gateway.shutdown().await;
}

// =============================================================================
// Dispatch: Stale cache fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_all_providers_fail_expired_cache_is_served_until_swept() {
    // Given: A price cached while the market trades (2 minute TTL)
    let http = ScriptedHttpClient::new();
    http.push(ALPHA, bars("AAPL"))
        .always(ALPHA, server_error())
        .always(BETA, server_error());
    let gateway = gateway(two_provider_config(), http.clone(), true);
    let mut first = WorkItem::new(aapl(), DataType::Price, Priority::High, Caller::system());
    let GatewayResponse::Data(original) = gateway.process(&mut first).await.expect("served") else {
        panic!("expected data");
    };

    // When: The entry expires and every provider fails
    tokio::time::advance(Duration::from_secs(150)).await;
    let mut second = WorkItem::new(aapl(), DataType::Price, Priority::High, Caller::system());
    let response = gateway.process(&mut second).await;

    // Then: The stale payload is returned instead of an error. alpha was the
    // only provider scored healthy, so it was the only candidate.
    assert_eq!(response, Ok(GatewayResponse::Data(original)));
    assert_eq!(second.provider, Some(alpha()));
    assert_eq!(http.calls_to(ALPHA), 2);
    assert_eq!(http.calls_to(BETA), 0);

    // And: Once swept, the same failure is final. With nothing healthy the
    // candidates fall back to registry order.
    assert_eq!(gateway.cache().sweep_expired(), 1);
    let mut third = WorkItem::new(aapl(), DataType::Price, Priority::High, Caller::system());
    match gateway.process(&mut third).await {
        Err(GatewayError::AllProvidersExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[test]
fn default_deployment_builds_without_network() {
    let gateway = quotegate_core::Gateway::builder(GatewayConfig::default())
        .with_http_client(std::sync::Arc::new(quotegate_core::NoopHttpClient))
        .build()
        .expect("defaults build");
    assert_eq!(gateway.registry().enabled().count(), 4);
}
