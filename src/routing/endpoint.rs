//! Endpoint data model
//!
//! An endpoint is an immutable descriptor (loaded at startup) plus mutable
//! runtime state. The descriptor is shared freely; runtime state is mutated
//! only under this endpoint's own mutex, and the breaker keeps its own
//! linearizable state.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_types::{
    ContextTokens, EndpointName, ModelId, PriorityRank, ResponseTokens,
};
use crate::routing::breaker::{BreakerSettings, CircuitBreaker};

/// Whether an endpoint is locally hosted or a remote cloud provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Locally hosted model server
    Local,
    /// Remote cloud provider
    Cloud,
}

/// Capability tags an endpoint advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Fill-in-the-middle completion
    Fim,
    /// Code generation and analysis
    Code,
    /// Extended reasoning
    Reasoning,
    /// Oversized context windows
    LargeContext,
}

/// How outbound calls to this endpoint authenticate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthPolicy {
    /// No authentication header
    None,
    /// `Authorization: Bearer <token>`, token read from the named variable
    Bearer {
        /// Environment variable holding the secret
        secret_env: String,
    },
}

impl AuthPolicy {
    /// Resolves the bearer token, if any
    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Bearer { secret_env } => std::env::var(secret_env).ok(),
        }
    }
}

/// Probe-derived health of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Never probed
    #[default]
    Unknown,
    /// Probes are succeeding
    Healthy,
    /// The most recent probe of a healthy endpoint failed
    Degraded,
    /// Consecutive probe failures crossed the threshold
    Unhealthy,
}

impl HealthState {
    /// Ordering key for candidate ranking: healthy > degraded > unknown
    ///
    /// Unhealthy endpoints are dropped before ranking, but the rank is total
    /// so status output can sort uniformly.
    #[must_use]
    pub fn selection_rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unknown => 2,
            Self::Unhealthy => 3,
        }
    }
}

/// Immutable endpoint descriptor, fixed after startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Stable endpoint name; the identifier used everywhere else
    pub name: EndpointName,
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Model id sent in the request body
    pub model: ModelId,
    /// Local or cloud, for the local-first balancer
    pub class: EndpointClass,
    /// Context window in estimated tokens
    pub max_context_tokens: ContextTokens,
    /// Response budget in estimated tokens
    pub max_response_tokens: ResponseTokens,
    /// Selection priority; smaller is preferred
    pub priority: PriorityRank,
    /// Outbound authentication policy
    pub auth: AuthPolicy,
    /// Advertised capability tags
    pub capabilities: BTreeSet<Capability>,
    /// Explicit health URL; defaults to `<base_url>/health`
    pub health_url: Option<String>,
}

impl EndpointDescriptor {
    /// URL for chat completions
    #[must_use]
    pub fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// URL for the models listing probe
    #[must_use]
    pub fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url.trim_end_matches('/'))
    }

    /// URL probed by the health monitor
    #[must_use]
    pub fn probe_url(&self) -> String {
        self.health_url
            .clone()
            .unwrap_or_else(|| format!("{}/health", self.base_url.trim_end_matches('/')))
    }

    /// Whether the endpoint advertises a capability
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Mutable runtime state for one endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointRuntime {
    /// Probe-derived health
    pub health: HealthState,
    /// When the last probe completed
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Latency of the last successful probe or call
    pub last_latency_ms: Option<u64>,
    /// Consecutive failed probes
    pub consecutive_probe_failures: u32,
    /// Consecutive successful probes since the last failure
    pub consecutive_probe_successes: u32,
    /// Total breaker-counted failures over the process lifetime
    pub failure_count: u64,
}

/// An endpoint: descriptor, runtime state, and breaker
#[derive(Debug)]
pub struct Endpoint {
    /// The immutable descriptor
    pub descriptor: EndpointDescriptor,
    runtime: Mutex<EndpointRuntime>,
    /// This endpoint's breaker
    pub breaker: CircuitBreaker,
}

/// Result of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe returned successfully within its timeout
    Success {
        /// Round-trip latency
        latency_ms: u64,
    },
    /// The probe failed or timed out
    Failure,
}

impl Endpoint {
    /// Creates an endpoint with unknown health and a closed breaker
    #[must_use]
    pub fn new(descriptor: EndpointDescriptor, breaker_settings: BreakerSettings) -> Self {
        Self {
            descriptor,
            runtime: Mutex::new(EndpointRuntime::default()),
            breaker: CircuitBreaker::new(breaker_settings),
        }
    }

    /// Snapshot of the runtime state
    #[must_use]
    pub fn runtime_snapshot(&self) -> EndpointRuntime {
        self.runtime.lock().expect("endpoint mutex poisoned").clone()
    }

    /// Current probe-derived health
    #[must_use]
    pub fn health(&self) -> HealthState {
        self.runtime.lock().expect("endpoint mutex poisoned").health
    }

    /// Latency of the last successful probe or call, if any
    #[must_use]
    pub fn last_latency_ms(&self) -> Option<u64> {
        self.runtime
            .lock()
            .expect("endpoint mutex poisoned")
            .last_latency_ms
    }

    /// Applies one probe result and the health transition rules
    ///
    /// One failure of a healthy endpoint degrades it; `unhealthy_after`
    /// consecutive failures mark it unhealthy; three consecutive successes
    /// after any failure restore it to healthy.
    pub fn record_probe(&self, outcome: ProbeOutcome, unhealthy_after: u32) {
        let mut runtime = self.runtime.lock().expect("endpoint mutex poisoned");
        runtime.last_probe_at = Some(Utc::now());
        match outcome {
            ProbeOutcome::Success { latency_ms } => {
                runtime.last_latency_ms = Some(latency_ms);
                runtime.consecutive_probe_failures = 0;
                runtime.consecutive_probe_successes =
                    runtime.consecutive_probe_successes.saturating_add(1);
                match runtime.health {
                    HealthState::Unknown => runtime.health = HealthState::Healthy,
                    HealthState::Healthy => {}
                    HealthState::Degraded | HealthState::Unhealthy => {
                        if runtime.consecutive_probe_successes >= 3 {
                            runtime.health = HealthState::Healthy;
                        }
                    }
                }
            }
            ProbeOutcome::Failure => {
                runtime.consecutive_probe_successes = 0;
                runtime.consecutive_probe_failures =
                    runtime.consecutive_probe_failures.saturating_add(1);
                if runtime.consecutive_probe_failures >= unhealthy_after {
                    runtime.health = HealthState::Unhealthy;
                } else if runtime.health == HealthState::Healthy
                    || runtime.health == HealthState::Unknown
                {
                    runtime.health = HealthState::Degraded;
                }
            }
        }
    }

    /// Records the latency of a successful chat call
    pub fn record_call_latency(&self, latency_ms: u64) {
        let mut runtime = self.runtime.lock().expect("endpoint mutex poisoned");
        runtime.last_latency_ms = Some(latency_ms);
    }

    /// Bumps the lifetime breaker-counted failure total
    pub fn record_counted_failure(&self) {
        let mut runtime = self.runtime.lock().expect("endpoint mutex poisoned");
        runtime.failure_count = runtime.failure_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, class: EndpointClass, priority: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            name: EndpointName::try_new(name.to_string()).unwrap(),
            base_url: format!("http://{name}.test:8080"),
            model: ModelId::try_new("test-model".to_string()).unwrap(),
            class,
            max_context_tokens: ContextTokens::try_new(32_768).unwrap(),
            max_response_tokens: ResponseTokens::try_new(4096).unwrap(),
            priority: PriorityRank::try_new(priority).unwrap(),
            auth: AuthPolicy::None,
            capabilities: BTreeSet::from([Capability::Code]),
            health_url: None,
        }
    }

    #[test]
    fn test_urls_are_joined_without_double_slashes() {
        let mut desc = descriptor("local", EndpointClass::Local, 1);
        desc.base_url = "http://localhost:8080/".to_string();
        assert_eq!(desc.chat_url(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(desc.models_url(), "http://localhost:8080/v1/models");
        assert_eq!(desc.probe_url(), "http://localhost:8080/health");
    }

    #[test]
    fn test_health_transitions() {
        let endpoint = Endpoint::new(
            descriptor("local", EndpointClass::Local, 1),
            BreakerSettings::default(),
        );
        assert_eq!(endpoint.health(), HealthState::Unknown);

        endpoint.record_probe(ProbeOutcome::Success { latency_ms: 12 }, 3);
        assert_eq!(endpoint.health(), HealthState::Healthy);

        // One failure of a healthy endpoint degrades it.
        endpoint.record_probe(ProbeOutcome::Failure, 3);
        assert_eq!(endpoint.health(), HealthState::Degraded);

        // Two more consecutive failures cross the threshold.
        endpoint.record_probe(ProbeOutcome::Failure, 3);
        endpoint.record_probe(ProbeOutcome::Failure, 3);
        assert_eq!(endpoint.health(), HealthState::Unhealthy);

        // Recovery requires three consecutive successes.
        endpoint.record_probe(ProbeOutcome::Success { latency_ms: 9 }, 3);
        endpoint.record_probe(ProbeOutcome::Success { latency_ms: 9 }, 3);
        assert_eq!(endpoint.health(), HealthState::Unhealthy);
        endpoint.record_probe(ProbeOutcome::Success { latency_ms: 9 }, 3);
        assert_eq!(endpoint.health(), HealthState::Healthy);
    }

    #[test]
    fn test_selection_rank_ordering() {
        assert!(HealthState::Healthy.selection_rank() < HealthState::Degraded.selection_rank());
        assert!(HealthState::Degraded.selection_rank() < HealthState::Unknown.selection_rank());
        assert!(HealthState::Unknown.selection_rank() < HealthState::Unhealthy.selection_rank());
    }
}
