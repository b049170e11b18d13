//! Endpoint selection
//!
//! Produces an ordered candidate list plus the per-endpoint timeout and
//! response-token budget for one request. Selection never refuses an
//! endpoint on predicted grounds: empirical evidence and the local-first
//! balancer only reorder, and the executor always tries the top candidate
//! first.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::classify::Classification;
use crate::domain_types::{
    ComplexMultiplier, EmpiricalDemoteThreshold, EmpiricalMinSamples, RequestTimeoutMs,
};
use crate::error::RouteError;
use crate::fingerprint::Fingerprint;
use crate::request::{RouteRequest, TaskHint};
use crate::routing::balance::LocalFirstBalancer;
use crate::routing::breaker::BreakerState;
use crate::routing::empirical::EmpiricalLearner;
use crate::routing::endpoint::{Capability, Endpoint, HealthState};
use crate::routing::registry::EndpointRegistry;

/// How the winning endpoint was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    /// Normal ranked selection
    Direct,
    /// Caller forced the endpoint
    Forced,
    /// Empirical evidence reordered the ranking
    Empirical,
    /// A later candidate served after earlier ones failed
    Failover,
}

/// Router tuning
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    /// Base per-endpoint timeout before complexity scaling
    pub base_timeout: RequestTimeoutMs,
    /// Timeout multiplier reached at complexity 1.0
    pub complex_multiplier: ComplexMultiplier,
    /// Success-rate floor for empirical demotion
    pub demote_threshold: EmpiricalDemoteThreshold,
    /// Observations required before demotion applies
    pub min_samples: EmpiricalMinSamples,
}

/// Ordered routing plan handed to the executor
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Candidates in try-order; the executor walks this on failover
    pub candidates: Vec<Arc<Endpoint>>,
    /// Timeout applied to each endpoint attempt
    pub per_endpoint_timeout: Duration,
    /// Response-token budget for the outbound call
    pub response_max_tokens: u32,
    /// Selection method for metadata
    pub method: RouteMethod,
    /// Short machine-readable reason
    pub reason_code: String,
    /// Confidence in the top candidate, in percent
    pub confidence_percent: u8,
    /// Whether empirical evidence demoted the original top candidate
    pub demoted: bool,
}

/// The smart router: registry + balancer + learner
#[derive(Debug)]
pub struct SmartRouter {
    registry: Arc<EndpointRegistry>,
    balancer: Arc<LocalFirstBalancer>,
    learner: Arc<EmpiricalLearner>,
    settings: RouterSettings,
}

impl SmartRouter {
    /// Creates a router over the shared registry, balancer, and learner
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        balancer: Arc<LocalFirstBalancer>,
        learner: Arc<EmpiricalLearner>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            balancer,
            learner,
            settings,
        }
    }

    /// Selects candidates for one request
    ///
    /// # Errors
    /// `RouteError::EndpointOpen` for a forced endpoint with an open breaker
    /// or when breakers have taken every endpoint out of rotation;
    /// `RouteError::InvalidRequest` for an unknown forced endpoint;
    /// `RouteError::Config` when no endpoint is usable for other reasons.
    pub fn route(
        &self,
        request: &RouteRequest,
        fingerprint: &Fingerprint,
        classification: &Classification,
    ) -> Result<RoutePlan, RouteError> {
        if let Some(forced) = &request.force_endpoint {
            return self.route_forced(forced, request, classification);
        }

        let mut candidates: Vec<Arc<Endpoint>> = self
            .registry
            .all()
            .iter()
            .filter(|endpoint| endpoint.breaker.state() != BreakerState::Open)
            .filter(|endpoint| endpoint.health() != HealthState::Unhealthy)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(self.nothing_selectable());
        }

        // Capability needs filter candidates, but only when at least one
        // endpoint can satisfy them; an impossible requirement must not
        // leave the request unroutable.
        if let Some(required) = required_capability(request, fingerprint) {
            let capable: Vec<Arc<Endpoint>> = candidates
                .iter()
                .filter(|endpoint| endpoint.descriptor.has_capability(required))
                .cloned()
                .collect();
            if !capable.is_empty() {
                candidates = capable;
            }
        }

        let preferred_class = self.balancer.preferred();
        candidates.sort_by(|a, b| {
            let key_a = (
                a.descriptor.priority,
                a.health().selection_rank(),
            );
            let key_b = (
                b.descriptor.priority,
                b.health().selection_rank(),
            );
            key_a
                .cmp(&key_b)
                .then_with(|| {
                    // Otherwise tied: bias toward the under-represented side.
                    match preferred_class {
                        Some(preferred) => {
                            let a_pref = a.descriptor.class == preferred;
                            let b_pref = b.descriptor.class == preferred;
                            b_pref.cmp(&a_pref)
                        }
                        None => std::cmp::Ordering::Equal,
                    }
                })
                .then_with(|| {
                    a.last_latency_ms()
                        .unwrap_or(u64::MAX)
                        .cmp(&b.last_latency_ms().unwrap_or(u64::MAX))
                })
        });

        // Empirical override: demote a top candidate with poor evidence on
        // this fingerprint below the runner-up. Reorder only; the new top
        // candidate is still tried first.
        let mut demoted = false;
        if candidates.len() >= 2
            && self.learner.should_demote(
                &fingerprint.hash,
                &candidates[0].descriptor.name,
                self.settings.demote_threshold,
                self.settings.min_samples,
            )
        {
            candidates.swap(0, 1);
            demoted = true;
            debug!(
                endpoint = candidates[1].descriptor.name.as_str(),
                fingerprint = %fingerprint.hash,
                "empirical evidence demoted top candidate"
            );
        }

        let top = Arc::clone(&candidates[0]);
        self.balancer.record(top.descriptor.class);

        let (method, reason_code) = if demoted {
            (RouteMethod::Empirical, "empirical_demotion".to_string())
        } else {
            (RouteMethod::Direct, "priority_rank".to_string())
        };
        let confidence = confidence_percent(&top, demoted);
        trace!(
            endpoint = top.descriptor.name.as_str(),
            candidates = candidates.len(),
            confidence,
            "route selected"
        );

        Ok(RoutePlan {
            per_endpoint_timeout: self.scaled_timeout(classification),
            response_max_tokens: self.response_budget(&top, request, classification),
            candidates,
            method,
            reason_code,
            confidence_percent: confidence,
            demoted,
        })
    }

    fn route_forced(
        &self,
        forced: &crate::domain_types::EndpointName,
        request: &RouteRequest,
        classification: &Classification,
    ) -> Result<RoutePlan, RouteError> {
        let endpoint = self.registry.get(forced).ok_or_else(|| {
            RouteError::InvalidRequest {
                reason: format!("unknown endpoint '{forced}'"),
            }
        })?;
        if endpoint.breaker.state() == BreakerState::Open {
            return Err(RouteError::EndpointOpen {
                endpoint: endpoint.descriptor.name.clone(),
            });
        }
        self.balancer.record(endpoint.descriptor.class);
        Ok(RoutePlan {
            per_endpoint_timeout: self.scaled_timeout(classification),
            response_max_tokens: self.response_budget(&endpoint, request, classification),
            candidates: vec![endpoint],
            method: RouteMethod::Forced,
            reason_code: "forced".to_string(),
            confidence_percent: 100,
            demoted: false,
        })
    }

    fn nothing_selectable(&self) -> RouteError {
        // Distinguish "breakers took everything out" from "nothing healthy".
        let open = self
            .registry
            .all()
            .iter()
            .find(|endpoint| endpoint.breaker.state() == BreakerState::Open);
        match open {
            Some(endpoint) => RouteError::EndpointOpen {
                endpoint: endpoint.descriptor.name.clone(),
            },
            None => RouteError::Config {
                reason: "no selectable endpoints: all are unhealthy".to_string(),
            },
        }
    }

    fn scaled_timeout(&self, classification: &Classification) -> Duration {
        let base = self.settings.base_timeout.as_duration();
        let span = self.settings.complex_multiplier.as_f64() - 1.0;
        let factor = 1.0 + span * classification.score.as_f64();
        base.mul_f64(factor)
    }

    /// Response budget scales with complexity exactly as the timeout does:
    /// a fully complex request gets the endpoint maximum, a trivial one gets
    /// the maximum divided by the multiplier.
    fn response_budget(
        &self,
        endpoint: &Endpoint,
        request: &RouteRequest,
        classification: &Classification,
    ) -> u32 {
        let max = f64::from(endpoint.descriptor.max_response_tokens.as_u32());
        let multiplier = self.settings.complex_multiplier.as_f64();
        let factor = (1.0 + (multiplier - 1.0) * classification.score.as_f64()) / multiplier;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (max * factor).round() as u32;
        let scaled = scaled.max(16);
        match request.max_tokens_override {
            Some(cap) => scaled.min(cap),
            None => scaled,
        }
    }
}

/// Capability a request implies, derived from the hint and fingerprint
fn required_capability(request: &RouteRequest, fingerprint: &Fingerprint) -> Option<Capability> {
    match request.task_hint {
        Some(TaskHint::Coding | TaskHint::Debugging) => Some(Capability::Code),
        Some(TaskHint::Analysis | TaskHint::Generation | TaskHint::General) | None => {
            if fingerprint.has_code {
                Some(Capability::Code)
            } else if fingerprint.length_bucket == crate::fingerprint::LengthBucket::Large {
                Some(Capability::LargeContext)
            } else {
                None
            }
        }
    }
}

fn confidence_percent(endpoint: &Endpoint, demoted: bool) -> u8 {
    let base = match endpoint.health() {
        HealthState::Healthy => 90,
        HealthState::Degraded => 70,
        HealthState::Unknown => 60,
        HealthState::Unhealthy => 40,
    };
    if demoted { base - 10 } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify;
    use crate::domain_types::{
        ContextTokens, EmpiricalMaxEntries, EndpointName, LocalFirstRatio, ModelId, PriorityRank,
        ResponseTokens,
    };
    use crate::error::AttemptOutcome;
    use crate::fingerprint::fingerprint_text;
    use crate::routing::breaker::BreakerSettings;
    use crate::routing::endpoint::{
        AuthPolicy, EndpointClass, EndpointDescriptor, ProbeOutcome,
    };
    use std::collections::BTreeSet;

    fn endpoint(name: &str, class: EndpointClass, priority: u8) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            EndpointDescriptor {
                name: EndpointName::try_new(name.to_string()).unwrap(),
                base_url: format!("http://{name}.test"),
                model: ModelId::try_new("m".to_string()).unwrap(),
                class,
                max_context_tokens: ContextTokens::try_new(32_768).unwrap(),
                max_response_tokens: ResponseTokens::try_new(4096).unwrap(),
                priority: PriorityRank::try_new(priority).unwrap(),
                auth: AuthPolicy::None,
                capabilities: BTreeSet::from([Capability::Code]),
                health_url: None,
            },
            BreakerSettings::default(),
        ))
    }

    fn router(endpoints: Vec<Arc<Endpoint>>) -> SmartRouter {
        let registry = Arc::new(EndpointRegistry::new(endpoints).unwrap());
        SmartRouter::new(
            registry,
            Arc::new(LocalFirstBalancer::new(LocalFirstRatio::default())),
            Arc::new(EmpiricalLearner::new(EmpiricalMaxEntries::default())),
            RouterSettings {
                base_timeout: RequestTimeoutMs::default(),
                complex_multiplier: ComplexMultiplier::default(),
                demote_threshold: EmpiricalDemoteThreshold::default(),
                min_samples: EmpiricalMinSamples::default(),
            },
        )
    }

    fn simple_request(prompt: &str) -> (RouteRequest, Fingerprint, Classification) {
        let request = RouteRequest::new(prompt);
        let fp = fingerprint_text(prompt, false);
        let cls = classify::classify(prompt);
        (request, fp, cls)
    }

    #[test]
    fn test_priority_wins_when_all_healthy() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let cloud = endpoint("cloud_a", EndpointClass::Cloud, 2);
        local.record_probe(ProbeOutcome::Success { latency_ms: 10 }, 3);
        cloud.record_probe(ProbeOutcome::Success { latency_ms: 10 }, 3);
        let router = router(vec![local, cloud]);

        let (request, fp, cls) = simple_request("Write a function to reverse a string in Go.");
        let plan = router.route(&request, &fp, &cls).unwrap();
        assert_eq!(plan.candidates[0].descriptor.name.as_str(), "local");
        assert_eq!(plan.method, RouteMethod::Direct);
        assert!(!plan.demoted);
    }

    #[test]
    fn test_open_breaker_never_first_candidate() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let cloud = endpoint("cloud_a", EndpointClass::Cloud, 2);
        local.breaker.trip_open();
        let router = router(vec![local, cloud]);

        let (request, fp, cls) = simple_request("hello");
        let plan = router.route(&request, &fp, &cls).unwrap();
        assert_eq!(plan.candidates[0].descriptor.name.as_str(), "cloud_a");
        assert!(
            plan.candidates
                .iter()
                .all(|c| c.descriptor.name.as_str() != "local")
        );
    }

    #[test]
    fn test_forced_endpoint_with_open_breaker_fails() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let cloud = endpoint("cloud_a", EndpointClass::Cloud, 2);
        cloud.breaker.trip_open();
        let router = router(vec![local, Arc::clone(&cloud)]);

        let (mut request, fp, cls) = simple_request("hello");
        request.force_endpoint = Some(cloud.descriptor.name.clone());
        let error = router.route(&request, &fp, &cls).unwrap_err();
        assert!(matches!(error, RouteError::EndpointOpen { .. }));
    }

    #[test]
    fn test_forced_endpoint_returns_it_alone() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let cloud = endpoint("cloud_a", EndpointClass::Cloud, 2);
        let router = router(vec![local, Arc::clone(&cloud)]);

        let (mut request, fp, cls) = simple_request("hello");
        request.force_endpoint = Some(cloud.descriptor.name.clone());
        let plan = router.route(&request, &fp, &cls).unwrap();
        assert_eq!(plan.candidates.len(), 1);
        assert_eq!(plan.candidates[0].descriptor.name.as_str(), "cloud_a");
        assert_eq!(plan.method, RouteMethod::Forced);
    }

    #[test]
    fn test_empirical_demotion_on_tied_ranking() {
        let a = endpoint("a", EndpointClass::Local, 1);
        let b = endpoint("b", EndpointClass::Local, 1);
        a.record_probe(ProbeOutcome::Success { latency_ms: 5 }, 3);
        b.record_probe(ProbeOutcome::Success { latency_ms: 50 }, 3);

        let registry = Arc::new(EndpointRegistry::new(vec![a, b]).unwrap());
        let learner = Arc::new(EmpiricalLearner::new(EmpiricalMaxEntries::default()));
        let router = SmartRouter::new(
            Arc::clone(&registry),
            Arc::new(LocalFirstBalancer::new(LocalFirstRatio::default())),
            Arc::clone(&learner),
            RouterSettings {
                base_timeout: RequestTimeoutMs::default(),
                complex_multiplier: ComplexMultiplier::default(),
                demote_threshold: EmpiricalDemoteThreshold::default(),
                min_samples: EmpiricalMinSamples::default(),
            },
        );

        let (request, fp, cls) = simple_request("hello there friend");
        // Record ten failures for endpoint a on this fingerprint.
        let a_name = EndpointName::try_new("a".to_string()).unwrap();
        for _ in 0..10 {
            learner.record(&fp.hash, &a_name, AttemptOutcome::Timeout, 100);
        }

        let plan = router.route(&request, &fp, &cls).unwrap();
        assert_eq!(plan.candidates[0].descriptor.name.as_str(), "b");
        assert!(plan.demoted);
        assert_eq!(plan.method, RouteMethod::Empirical);
        // The demoted endpoint is still in the list, just not first.
        assert_eq!(plan.candidates[1].descriptor.name.as_str(), "a");
    }

    #[test]
    fn test_timeout_scales_with_complexity() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let router = router(vec![local]);

        let (request, fp, simple) = simple_request("What is Rust?");
        let plan = router.route(&request, &fp, &simple).unwrap();
        let base = RequestTimeoutMs::default().as_duration();
        assert!(plan.per_endpoint_timeout >= base);
        // A simple request stays near the base timeout.
        assert!(plan.per_endpoint_timeout < base.mul_f64(1.5));

        let complex_text =
            "Design an event-driven microservices architecture with orchestration, \
             high availability and a migration plan.";
        let (request, fp, complex) = simple_request(complex_text);
        let plan = router.route(&request, &fp, &complex).unwrap();
        assert!(plan.per_endpoint_timeout > base.mul_f64(2.0));
        assert!(plan.per_endpoint_timeout <= base.mul_f64(3.0));
    }

    #[test]
    fn test_response_budget_honors_override() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let router = router(vec![local]);
        let (mut request, fp, cls) = simple_request("What is Rust?");
        request.max_tokens_override = Some(128);
        let plan = router.route(&request, &fp, &cls).unwrap();
        assert_eq!(plan.response_max_tokens, 128);
    }

    #[test]
    fn test_unknown_forced_endpoint_is_invalid_request() {
        let router = router(vec![endpoint("local", EndpointClass::Local, 1)]);
        let (mut request, fp, cls) = simple_request("hello");
        request.force_endpoint = Some(EndpointName::try_new("missing".to_string()).unwrap());
        let error = router.route(&request, &fp, &cls).unwrap_err();
        assert!(matches!(error, RouteError::InvalidRequest { .. }));
    }
}
