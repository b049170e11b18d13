//! Background health monitoring
//!
//! A long-lived task probes every endpoint on a fixed interval and applies
//! the health transition rules on the endpoint itself. The router only ever
//! reads the most recent state; nothing on the request path waits for a
//! probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain_types::{FailureThreshold, ProbeIntervalMs, ProbeTimeoutMs};
use crate::routing::endpoint::{Endpoint, EndpointDescriptor, ProbeOutcome};
use crate::routing::registry::EndpointRegistry;

/// Seam for issuing one health probe
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes one endpoint, bounded by `timeout`
    async fn probe(&self, endpoint: &EndpointDescriptor, timeout: Duration) -> ProbeOutcome;
}

/// HTTP implementation: GET the health URL, falling back to `/v1/models`
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Creates a probe around a shared HTTP client
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_ok(&self, url: &str, bearer: Option<&str>, timeout: Duration) -> bool {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &EndpointDescriptor, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        let bearer = endpoint.auth.bearer_token();
        let healthy = self
            .get_ok(&endpoint.probe_url(), bearer.as_deref(), timeout)
            .await
            || self
                .get_ok(&endpoint.models_url(), bearer.as_deref(), timeout)
                .await;
        if healthy {
            #[allow(clippy::cast_possible_truncation)]
            let latency_ms = started.elapsed().as_millis() as u64;
            ProbeOutcome::Success { latency_ms }
        } else {
            ProbeOutcome::Failure
        }
    }
}

/// Configuration for the monitor loop
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorSettings {
    /// Time between probe rounds
    pub interval: ProbeIntervalMs,
    /// Per-probe timeout
    pub timeout: ProbeTimeoutMs,
    /// Consecutive probe failures before an endpoint is unhealthy
    pub unhealthy_after: FailureThreshold,
}

/// Spawns the background monitor; cancellation stops it promptly
pub fn spawn_health_monitor(
    registry: Arc<EndpointRegistry>,
    probe: Arc<dyn HealthProbe>,
    settings: HealthMonitorSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            endpoints = registry.len(),
            interval_ms = %settings.interval,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(settings.interval.as_duration());
        // The first tick fires immediately so startup gets health state fast.
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("health monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    probe_round(&registry, probe.as_ref(), settings).await;
                }
            }
        }
    })
}

async fn probe_round(
    registry: &EndpointRegistry,
    probe: &dyn HealthProbe,
    settings: HealthMonitorSettings,
) {
    let probes = registry.all().iter().map(|endpoint| {
        let endpoint = Arc::clone(endpoint);
        async move {
            let outcome = probe
                .probe(&endpoint.descriptor, settings.timeout.as_duration())
                .await;
            apply_probe(&endpoint, outcome, settings.unhealthy_after);
        }
    });
    join_all(probes).await;
}

fn apply_probe(endpoint: &Endpoint, outcome: ProbeOutcome, unhealthy_after: FailureThreshold) {
    let before = endpoint.health();
    endpoint.record_probe(outcome, unhealthy_after.as_u32());
    let after = endpoint.health();
    if before != after {
        warn!(
            endpoint = endpoint.descriptor.name.as_str(),
            ?before,
            ?after,
            "endpoint health changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{
        ContextTokens, EndpointName, ModelId, PriorityRank, ResponseTokens,
    };
    use crate::routing::breaker::BreakerSettings;
    use crate::routing::endpoint::{AuthPolicy, EndpointClass, HealthState};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _endpoint: &EndpointDescriptor, _timeout: Duration) -> ProbeOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                ProbeOutcome::Failure
            } else {
                ProbeOutcome::Success { latency_ms: 7 }
            }
        }
    }

    fn endpoint(name: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            EndpointDescriptor {
                name: EndpointName::try_new(name.to_string()).unwrap(),
                base_url: format!("http://{name}.test"),
                model: ModelId::try_new("m".to_string()).unwrap(),
                class: EndpointClass::Local,
                max_context_tokens: ContextTokens::default(),
                max_response_tokens: ResponseTokens::default(),
                priority: PriorityRank::default(),
                auth: AuthPolicy::None,
                capabilities: BTreeSet::new(),
                health_url: None,
            },
            BreakerSettings::default(),
        ))
    }

    fn settings() -> HealthMonitorSettings {
        HealthMonitorSettings {
            interval: ProbeIntervalMs::try_new(1000).unwrap(),
            timeout: ProbeTimeoutMs::try_new(100).unwrap(),
            unhealthy_after: FailureThreshold::try_new(3).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_probe_round_marks_unhealthy_then_recovers() {
        let target = endpoint("local");
        let registry = Arc::new(EndpointRegistry::new(vec![Arc::clone(&target)]).unwrap());
        let probe = ScriptedProbe {
            calls: AtomicU32::new(0),
            fail_first: 3,
        };

        for _ in 0..3 {
            probe_round(&registry, &probe, settings()).await;
        }
        assert_eq!(target.health(), HealthState::Unhealthy);

        // Three consecutive successes restore the endpoint.
        for _ in 0..3 {
            probe_round(&registry, &probe, settings()).await;
        }
        assert_eq!(target.health(), HealthState::Healthy);
        assert_eq!(target.last_latency_ms(), Some(7));
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancellation() {
        let registry = Arc::new(EndpointRegistry::new(vec![endpoint("local")]).unwrap());
        let probe: Arc<dyn HealthProbe> = Arc::new(ScriptedProbe {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let cancel = CancellationToken::new();
        let handle = spawn_health_monitor(registry, probe, settings(), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
