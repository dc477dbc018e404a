//! End-to-end routing: selection, sticky sessions, admission, and
//! cancellation through the public federation API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use afcp_core::config::AfcpConfig;
use afcp_core::dispatcher::RouteOptions;
use afcp_core::error::FederationError;
use afcp_core::hash::stable_hash;
use afcp_core::registry::AgentHealth;
use afcp_core::selector::SelectOptions;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::{federation_with, register_agent, BlockingTransport, EndpointEcho};

/// Timeout bounding individual test operations.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_routes_to_least_loaded_capable_agent() {
    let (federation, _clock) = federation_with(AfcpConfig::default(), Arc::new(EndpointEcho));
    register_agent(&federation, "a", &["x"], 0.5);
    register_agent(&federation, "b", &["x", "y"], 0.3);

    let served = federation
        .route("x", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(served, Bytes::from_static(b"b"));

    let served = federation
        .route("y", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(served, Bytes::from_static(b"b"));

    let err = federation
        .route("z", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::NoAgentAvailable(_)));
}

#[tokio::test]
async fn test_sticky_routing_is_stable_until_candidates_change() {
    let (federation, _clock) = federation_with(AfcpConfig::default(), Arc::new(EndpointEcho));
    register_agent(&federation, "a", &["x"], 0.5);
    register_agent(&federation, "b", &["x", "y"], 0.3);

    let opts = RouteOptions {
        select: SelectOptions {
            sticky_session_key: Some("user-42".into()),
            ..SelectOptions::default()
        },
        ..RouteOptions::default()
    };

    // Candidates sorted as [a, b]; the pinned hash decides which serves.
    let expected = ["a", "b"][stable_hash("user-42") as usize % 2];
    for _ in 0..5 {
        let served = federation
            .route("x", Bytes::new(), &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(served, Bytes::from(expected.to_string()));
    }

    // Shrinking the candidate set remaps the key deterministically.
    federation.deregister("b");
    let served = federation
        .route("x", Bytes::new(), &opts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(served, Bytes::from_static(b"a"));
}

#[tokio::test]
async fn test_rate_limit_four_immediate_calls() {
    let config: AfcpConfig = serde_json::from_str(
        r#"{ "admission": { "window_length": "1s", "max_requests": 3, "burst": 3 } }"#,
    )
    .unwrap();
    let (federation, _clock) = federation_with(config, Arc::new(EndpointEcho));
    register_agent(&federation, "a", &["x"], 0.0);

    let opts = RouteOptions {
        client_id: Some("u1".into()),
        ..RouteOptions::default()
    };

    for i in 0..3 {
        let result = federation
            .route("x", Bytes::new(), &opts, &CancellationToken::new())
            .await;
        assert!(result.is_ok(), "call {i} should be admitted");
    }

    match federation
        .route("x", Bytes::new(), &opts, &CancellationToken::new())
        .await
        .unwrap_err()
    {
        FederationError::RateLimited { retry_after } => {
            assert!(retry_after >= Duration::from_secs(1));
        },
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // A different client still has budget.
    let other = RouteOptions {
        client_id: Some("u2".into()),
        ..RouteOptions::default()
    };
    assert!(federation
        .route("x", Bytes::new(), &other, &CancellationToken::new())
        .await
        .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_route_leaves_agent_untouched() {
    let (federation, _clock) = federation_with(AfcpConfig::default(), Arc::new(BlockingTransport));
    register_agent(&federation, "a", &["x"], 0.5);
    let before = federation.registry().get("a").unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        TEST_TIMEOUT,
        federation.route("x", Bytes::new(), &RouteOptions::default(), &cancel),
    )
    .await
    .expect("route should settle well before the test timeout")
    .unwrap_err();
    assert!(matches!(err, FederationError::Cancelled));

    let after = federation.registry().get("a").unwrap();
    assert!((after.load_avg - before.load_avg).abs() < f64::EPSILON);
    assert_eq!(after.health, before.health);
}

#[tokio::test]
async fn test_failed_route_degrades_then_requires_healthy_excludes() {
    let (federation, _clock) = federation_with(
        AfcpConfig::default(),
        Arc::new(common::ScriptedTransport::failing(&["a"])),
    );
    register_agent(&federation, "a", &["x"], 0.0);

    let err = federation
        .route("x", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::AgentError { .. }));
    assert_eq!(
        federation.registry().get("a").unwrap().health,
        AgentHealth::Degraded
    );

    // Degraded agents are excluded by the default healthy-only policy.
    let err = federation
        .route("x", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::NoAgentAvailable(_)));

    // But remain routable when the caller opts out.
    let relaxed = RouteOptions {
        select: SelectOptions {
            require_healthy: false,
            ..SelectOptions::default()
        },
        ..RouteOptions::default()
    };
    let err = federation
        .route("x", Bytes::new(), &relaxed, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::AgentError { .. }));
}

#[tokio::test]
async fn test_metrics_reflect_route_traffic() {
    let (federation, _clock) = federation_with(AfcpConfig::default(), Arc::new(EndpointEcho));
    register_agent(&federation, "a", &["x"], 0.0);

    federation
        .route("x", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    let _ = federation
        .route("missing", Bytes::new(), &RouteOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    let payload = federation.metrics();
    assert!(payload.contains(
        "afcp_route_requests_total{capability=\"x\",outcome=\"ok\"} 1"
    ));
    assert!(payload.contains(
        "afcp_route_requests_total{capability=\"missing\",outcome=\"no_agent\"} 1"
    ));
    assert!(payload.contains("afcp_route_latency_seconds_count{capability=\"x\"} 1"));
    assert!(payload.ends_with("# EOF\n"));
}
