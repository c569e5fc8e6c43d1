//! Behavior-driven tests for priority admission
//!
//! These tests verify HOW requests enter the gateway: lane capacity,
//! strict priority between lanes, cancellation and wait estimates.

mod common;

use std::time::Duration;

use quotegate_core::{
    AdmissionQueue, Caller, DataType, GatewayError, GatewayResponse, Priority, QueueConfig, Symbol,
    WorkItem, WorkState,
};

use common::{bars, gateway, two_provider_config, ScriptedHttpClient, ALPHA};

fn symbol(raw: &str) -> Symbol {
    Symbol::parse(raw).expect("valid symbol")
}

fn item(raw: &str, priority: Priority) -> WorkItem {
    WorkItem::new(symbol(raw), DataType::Price, priority, Caller::system())
}

// =============================================================================
// Admission: Capacity
// =============================================================================

#[test]
fn when_a_lane_is_full_new_requests_are_rejected_immediately() {
    // Given: A queue whose high lane holds two items
    let queue = AdmissionQueue::new(&QueueConfig {
        high_capacity: 2,
        ..QueueConfig::default()
    });
    assert!(queue.enqueue(item("AAPL", Priority::High)));
    assert!(queue.enqueue(item("MSFT", Priority::High)));

    // When: A third high-priority request arrives
    let rejected = queue.submit(item("NVDA", Priority::High));

    // Then: It is rejected without blocking and other lanes still accept work
    match rejected {
        Err(GatewayError::AdmissionRejected { priority, capacity }) => {
            assert_eq!(priority, Priority::High);
            assert_eq!(capacity, 2);
        }
        other => panic!("expected admission rejection, got {other:?}"),
    }
    assert!(queue.enqueue(item("NVDA", Priority::Low)));

    let stats = queue.stats();
    assert_eq!(stats.total, 3, "rejected requests are not counted");
    assert_eq!(stats.lane(Priority::High).map(|lane| lane.size), Some(2));
}

#[test]
fn rejected_admission_is_not_retryable() {
    let error = GatewayError::AdmissionRejected {
        priority: Priority::Low,
        capacity: 1,
    };
    assert!(!error.retryable());
    assert_eq!(error.code(), "gateway.admission_rejected");
}

// =============================================================================
// Admission: Ordering
// =============================================================================

#[tokio::test]
async fn when_high_work_arrives_after_low_work_it_is_served_first() {
    // Given: A gateway with no workers running yet and both lanes populated
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, bars("AAPL"));
    let gateway = gateway(two_provider_config(), http.clone(), false);

    let low = gateway
        .submit(symbol("AAPL"), DataType::Price, Priority::Low)
        .expect("admitted");
    let high = gateway
        .submit(symbol("MSFT"), DataType::Price, Priority::High)
        .expect("admitted");

    // When: The single worker starts draining
    gateway.start_workers();
    let high_result = high.wait().await;
    let low_result = low.wait().await;

    // Then: The high request reached the provider first
    assert!(high_result.is_ok());
    assert!(low_result.is_ok());
    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("/bars/MSFT"), "first call was {}", calls[0]);
    assert!(calls[1].contains("/bars/AAPL"), "second call was {}", calls[1]);

    gateway.shutdown().await;
}

#[test]
fn wait_estimate_scales_with_lane_depth() {
    // Given: Three medium requests queued for one worker completing one request per second
    let queue = AdmissionQueue::new(&QueueConfig {
        workers: 1,
        throughput_per_worker: 1.0,
        ..QueueConfig::default()
    });
    for raw in ["AAPL", "MSFT", "NVDA"] {
        assert!(queue.enqueue(item(raw, Priority::Medium)));
    }

    // Then: The estimate is lane size over total throughput
    assert_eq!(queue.estimated_wait(Priority::Medium), Duration::from_millis(3_000));
    assert_eq!(queue.estimated_wait(Priority::High), Duration::ZERO);
}

// =============================================================================
// Admission: Cancellation and shutdown
// =============================================================================

#[tokio::test]
async fn when_a_queued_request_is_cancelled_it_never_reaches_a_provider() {
    // Given: A queued request and no workers
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, bars("AAPL"));
    let gateway = gateway(two_provider_config(), http.clone(), false);
    let submission = gateway
        .submit(symbol("AAPL"), DataType::Price, Priority::Medium)
        .expect("admitted");
    let id = submission.id;

    // When: The caller cancels before a worker picks it up
    assert!(gateway.cancel(id));

    // Then: The caller is told it was cancelled and nothing is fetched
    assert_eq!(submission.wait().await, Ok(GatewayResponse::Cancelled));
    assert!(!gateway.cancel(id), "a second cancel finds nothing");
    assert_eq!(gateway.queue().state_of(id), None);

    gateway.start_workers();
    gateway.shutdown().await;
    assert_eq!(http.calls().len(), 0);
    assert_eq!(gateway.queue().stats().cancelled, 1);
}

#[tokio::test]
async fn submissions_after_shutdown_are_refused() {
    let gateway = gateway(two_provider_config(), ScriptedHttpClient::new(), false);
    gateway.shutdown().await;

    let refused = gateway.submit(symbol("AAPL"), DataType::Price, Priority::High);
    assert!(matches!(refused, Err(GatewayError::Shutdown)));
}

#[tokio::test]
async fn completed_requests_are_tracked_until_they_finish() {
    let http = ScriptedHttpClient::new();
    http.always(ALPHA, bars("AAPL"));
    let gateway = gateway(two_provider_config(), http, false);
    let submission = gateway
        .submit(symbol("AAPL"), DataType::Price, Priority::High)
        .expect("admitted");
    let id = submission.id;
    assert_eq!(gateway.queue().state_of(id), Some(WorkState::Queued));

    gateway.start_workers();
    assert!(matches!(submission.wait().await, Ok(GatewayResponse::Data(_))));
    assert_eq!(gateway.queue().state_of(id), None);

    let stats = gateway.queue().stats();
    assert_eq!((stats.total, stats.completed, stats.in_flight), (1, 1, 0));
    assert_eq!(stats.success_rate, 100.0);
    gateway.shutdown().await;
}
