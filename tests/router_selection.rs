//! Selection behavior through the service: forced endpoints, empirical
//! demotion, the local-first balancer, and the status surface.

mod common;

use std::time::Duration;

use common::{Behavior, MockBackend, endpoint_config, service_with, two_endpoints};
use lodestar::domain_types::EndpointName;
use lodestar::request::RouteRequest;
use lodestar::routing::BreakerState;
use lodestar::routing::router::RouteMethod;

fn name(s: &str) -> EndpointName {
    EndpointName::try_new(s.to_string()).unwrap()
}

#[tokio::test]
async fn test_forced_endpoint_bypasses_ranking() {
    let backend = MockBackend::new();
    backend.script(
        "cloud_a",
        Behavior::Succeed {
            content: "forced cloud response".to_string(),
            delay: Duration::from_millis(2),
        },
    );
    let service = service_with(backend.clone(), two_endpoints());

    let mut request = RouteRequest::new("route me to the cloud please");
    request.force_endpoint = Some(name("cloud_a"));
    let outcome = service.query(request).await.unwrap();

    assert_eq!(outcome.metadata.routing_decision.endpoint_used, "cloud_a");
    assert_eq!(outcome.metadata.routing_decision.method, RouteMethod::Forced);
    assert_eq!(outcome.metadata.routing_decision.confidence_percent, 100);
    assert_eq!(backend.calls("local"), 0);
}

#[tokio::test]
async fn test_unknown_forced_endpoint_is_rejected() {
    let backend = MockBackend::new();
    let service = service_with(backend.clone(), two_endpoints());

    let mut request = RouteRequest::new("hello");
    request.force_endpoint = Some(name("nonexistent"));
    let failure = service.query(request).await.unwrap_err();
    assert_eq!(
        failure.error.kind(),
        lodestar::error::ErrorKind::InvalidRequest
    );
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_execution_outcomes_feed_the_learner() {
    // Two endpoints tied on priority so evidence is the tie-breaker.
    let backend = MockBackend::new();
    backend.script("local", Behavior::Timeout);
    backend.script(
        "cloud_a",
        Behavior::Succeed {
            content: "cloud handles it".to_string(),
            delay: Duration::from_millis(2),
        },
    );
    let endpoints = vec![
        endpoint_config("local", "http://localhost:8081", 1),
        endpoint_config("cloud_a", "https://cloud-a.example.com", 1),
    ];
    let service = service_with(backend.clone(), endpoints);

    let outcome = service
        .query(RouteRequest::new("How do I parse a CSV file?"))
        .await
        .unwrap();

    // Local timed out, cloud served; both observations reached the learner
    // and the serving endpoint's entry backs the metadata.
    assert_eq!(outcome.metadata.routing_decision.endpoint_used, "cloud_a");
    assert_eq!(outcome.metadata.empirical_routing.sample_count, 1);
    assert_eq!(
        outcome.metadata.empirical_routing.historical_success_rate,
        Some(1.0)
    );
    let local = service.registry().get(&name("local")).unwrap();
    assert_eq!(local.breaker.failure_streak(), 1);
}

#[tokio::test]
async fn test_status_report_covers_every_surface() {
    let backend = MockBackend::new();
    let service = service_with(backend.clone(), two_endpoints());

    let _ = service
        .query(RouteRequest::new("implement a queue in rust"))
        .await
        .unwrap();
    let _ = service
        .query(RouteRequest::new("implement a queue in rust"))
        .await
        .unwrap();

    let status = service.status();
    assert_eq!(status.requests, 2);
    assert_eq!(status.endpoints.len(), 2);

    let local = status.endpoints.iter().find(|e| e.name == "local").unwrap();
    assert_eq!(local.breaker_state, BreakerState::Closed);
    assert_eq!(local.counters.successes, 1);

    assert_eq!(status.cache.entries, 1);
    assert!(status.cache.hits >= 1);
    assert!(status.observed_local_ratio.is_some());
    assert!(!status.empirical_top.is_empty());
}

#[tokio::test]
async fn test_local_first_ratio_observed_over_window() {
    let backend = MockBackend::new();
    let service = service_with(backend.clone(), two_endpoints());

    // Several distinct healthy-local queries: everything should land local,
    // and the observed ratio should say so.
    let prompts = [
        "implement a stack in go",
        "explain what a semaphore does",
        "fix this broken crash error",
        "analyze this csv dataset for anomalies",
    ];
    for prompt in prompts {
        let outcome = service.query(RouteRequest::new(prompt)).await.unwrap();
        assert_eq!(outcome.metadata.routing_decision.endpoint_used, "local");
    }

    let ratio = service.status().observed_local_ratio.unwrap();
    assert!(ratio > 0.9, "observed ratio {ratio}");
}

#[tokio::test]
async fn test_unhealthy_endpoint_is_not_selected() {
    use lodestar::routing::ProbeOutcome;

    let backend = MockBackend::new();
    backend.script(
        "cloud_a",
        Behavior::Succeed {
            content: "cloud".to_string(),
            delay: Duration::from_millis(2),
        },
    );
    let service = service_with(backend.clone(), two_endpoints());

    // Drive local unhealthy through the same transitions the monitor uses.
    let local = service.registry().get(&name("local")).unwrap();
    for _ in 0..3 {
        local.record_probe(ProbeOutcome::Failure, 3);
    }

    let outcome = service
        .query(RouteRequest::new("who will serve this one"))
        .await
        .unwrap();
    assert_eq!(outcome.metadata.routing_decision.endpoint_used, "cloud_a");
    assert_eq!(backend.calls("local"), 0);
}
