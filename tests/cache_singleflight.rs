//! Cache behavior through the full service: single-flight coalescing,
//! fingerprint equivalence, TTL, and metadata shape for cached responses.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Behavior, MockBackend, service_with, two_endpoints};
use lodestar::request::RouteRequest;

#[tokio::test]
async fn test_fifty_concurrent_identical_requests_make_one_call() {
    let backend = MockBackend::new();
    backend.script(
        "local",
        Behavior::Succeed {
            content: "the one true answer".to_string(),
            delay: Duration::from_millis(30),
        },
    );
    let service = service_with(backend.clone(), two_endpoints());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service
                .query(RouteRequest::new("How do I parse a CSV file?"))
                .await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.response, "the one true answer");
    }

    assert_eq!(backend.calls("local"), 1);
    assert_eq!(service.cache_stats().entries, 1);
}

#[tokio::test]
async fn test_repeat_query_is_served_from_cache() {
    let backend = MockBackend::new();
    let service = service_with(backend.clone(), two_endpoints());

    let first = service
        .query(RouteRequest::new("explain the borrow checker to me"))
        .await
        .unwrap();
    assert!(!first.metadata.cache_hit);

    let second = service
        .query(RouteRequest::new("explain the borrow checker to me"))
        .await
        .unwrap();
    assert!(second.metadata.cache_hit);
    assert_eq!(second.response, first.response);
    assert_eq!(second.metadata.routing_decision.reason_code, "cache_hit");
    assert!(second.metadata.attempts.is_empty());
    assert_eq!(backend.calls("local"), 1);
}

#[tokio::test]
async fn test_whitespace_variants_share_a_cache_entry() {
    let backend = MockBackend::new();
    let service = service_with(backend.clone(), two_endpoints());

    let first = service
        .query(RouteRequest::new("How   do I\nparse a CSV file?"))
        .await
        .unwrap();
    let second = service
        .query(RouteRequest::new("How do I parse a CSV file?"))
        .await
        .unwrap();

    assert!(second.metadata.cache_hit);
    assert_eq!(
        first.metadata.empirical_routing.fingerprint_hash,
        second.metadata.empirical_routing.fingerprint_hash
    );
    assert_eq!(backend.calls("local"), 1);
}

#[tokio::test]
async fn test_failed_production_caches_nothing() {
    let backend = MockBackend::new();
    backend.script("local", Behavior::ServerError);
    backend.script("cloud_a", Behavior::ServerError);
    let service = service_with(backend.clone(), two_endpoints());

    let failure = service
        .query(RouteRequest::new("destined to fail"))
        .await
        .unwrap_err();
    assert!(!failure.attempts.is_empty());
    assert_eq!(service.cache_stats().entries, 0);

    // A later identical request is not poisoned by a cached error: it runs
    // the pipeline again.
    let _ = service.query(RouteRequest::new("destined to fail")).await;
    assert!(backend.calls("local") >= 2 || backend.calls("cloud_a") >= 2);
}

#[tokio::test]
async fn test_coalesced_failure_settles_every_waiter() {
    let backend = MockBackend::new();
    backend.script("local", Behavior::ServerError);
    backend.script("cloud_a", Behavior::Capacity);
    let service = service_with(backend.clone(), two_endpoints());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service
                .query(RouteRequest::new("shared doomed request"))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
}
