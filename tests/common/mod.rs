//! Shared fixtures for integration tests: a scripted chat backend and a
//! health probe that always succeeds.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lodestar::cache::TokenUsage;
use lodestar::config::{AuthKind, EndpointConfig, RouterConfig};
use lodestar::error::RouteError;
use lodestar::executor::{ChatBackend, ChatCall, ChatSuccess};
use lodestar::routing::{
    Capability, EndpointDescriptor, HealthProbe, ProbeOutcome,
};
use lodestar::service::RouterService;

/// How a scripted endpoint behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeed with this content after the delay
    Succeed {
        /// Response text
        content: String,
        /// Simulated latency
        delay: Duration,
    },
    /// Fail with a timeout, as the HTTP client would after its deadline
    Timeout,
    /// Fail with a 429
    Capacity,
    /// Fail with a 503
    ServerError,
    /// Fail with a 400
    ClientError,
    /// Fail with a connection error
    Network,
    /// Sleep until cancelled
    Hang,
}

/// Scripted chat backend keyed by endpoint name
pub struct MockBackend {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn script(&self, endpoint: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), behavior);
    }

    pub fn calls(&self, endpoint: &str) -> u32 {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn complete(
        &self,
        endpoint: &EndpointDescriptor,
        call: &ChatCall,
        cancel: &CancellationToken,
    ) -> Result<ChatSuccess, RouteError> {
        let name = endpoint.name.as_str().to_string();
        *self.calls.lock().unwrap().entry(name.clone()).or_insert(0) += 1;

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(Behavior::Succeed {
                content: format!("response from {name}"),
                delay: Duration::from_millis(5),
            });

        match behavior {
            Behavior::Succeed { content, delay } => {
                tokio::select! {
                    () = cancel.cancelled() => Err(RouteError::Cancelled),
                    () = tokio::time::sleep(delay) => Ok(ChatSuccess {
                        content,
                        token_usage: TokenUsage {
                            prompt_tokens: 10,
                            completion_tokens: 20,
                            total_tokens: 30,
                        },
                    }),
                }
            }
            Behavior::Timeout => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let elapsed_ms = u64::try_from(call.timeout.as_millis()).unwrap_or(u64::MAX);
                Err(RouteError::Timeout {
                    endpoint: endpoint.name.clone(),
                    elapsed_ms,
                })
            }
            Behavior::Capacity => Err(RouteError::Capacity {
                endpoint: endpoint.name.clone(),
            }),
            Behavior::ServerError => Err(RouteError::Upstream5xx {
                endpoint: endpoint.name.clone(),
                status: 503,
            }),
            Behavior::ClientError => Err(RouteError::Upstream4xx {
                endpoint: endpoint.name.clone(),
                status: 400,
            }),
            Behavior::Network => Err(RouteError::Network {
                endpoint: endpoint.name.clone(),
                reason: "connection refused".to_string(),
            }),
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(RouteError::Cancelled)
            }
        }
    }
}

/// Probe that always reports success
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn probe(&self, _endpoint: &EndpointDescriptor, _timeout: Duration) -> ProbeOutcome {
        ProbeOutcome::Success { latency_ms: 3 }
    }
}

/// A local + cloud endpoint pair, local preferred
pub fn two_endpoints() -> Vec<EndpointConfig> {
    vec![
        endpoint_config("local", "http://localhost:8081", 1),
        endpoint_config("cloud_a", "https://cloud-a.example.com", 2),
    ]
}

pub fn endpoint_config(name: &str, base_url: &str, priority: u8) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        model: "test-model".to_string(),
        class: None,
        priority: Some(priority),
        max_context_tokens: Some(32_768),
        max_response_tokens: Some(4096),
        auth_kind: AuthKind::None,
        auth_secret_ref: None,
        capabilities: vec![Capability::Code],
        health_url: None,
    }
}

/// Service over the mock backend with the testing preset
pub fn service_with(
    backend: Arc<MockBackend>,
    endpoints: Vec<EndpointConfig>,
) -> Arc<RouterService> {
    let mut config = RouterConfig::testing();
    config.endpoints = endpoints;
    Arc::new(
        RouterService::with_backends(config, backend, Arc::new(AlwaysHealthy))
            .expect("service must build"),
    )
}
