//! The router service
//!
//! Composes the registry, health monitor, cache, learner, balancer, and
//! executor into the full request pipeline: fingerprint, cache check,
//! classify, route, assemble, execute, record. Also owns graceful shutdown:
//! new requests are refused, in-flight ones drain inside a bounded window,
//! and the learner snapshot flushes on the way out.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::analysis::{
    AnalysisOptions, AnalysisReport, FileUnit, PathPolicy, ReadOptions, analyze, assemble,
};
use crate::cache::{CacheStats, CachedResponse, ResponseCache};
use crate::classify::{self, Classification, Intent};
use crate::config::RouterConfig;
use crate::domain_types::RequestId;
use crate::error::RouteError;
use crate::executor::{ChatBackend, ExecutionAttempt, Executor, HttpChatBackend, RetryPolicy};
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::request::RouteRequest;
use crate::routing::balance::LocalFirstBalancer;
use crate::routing::breaker::{BreakerSettings, BreakerState};
use crate::routing::empirical::{EmpiricalLearner, EmpiricalPattern};
use crate::routing::endpoint::{Endpoint, EndpointClass, HealthState};
use crate::routing::health::{
    HealthMonitorSettings, HealthProbe, HttpHealthProbe, spawn_health_monitor,
};
use crate::routing::registry::EndpointRegistry;
use crate::routing::router::{RouteMethod, RouterSettings, SmartRouter};
use crate::stats::{EndpointCounters, ExecutionLog};

/// Structured routing decision returned with every query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// The endpoint that produced the response
    pub endpoint_used: String,
    /// Machine-readable selection reason
    pub reason_code: String,
    /// Confidence in the selection, percent
    pub confidence_percent: u8,
    /// Selection method
    pub method: RouteMethod,
}

/// Empirical-learner context for the request's fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmpiricalRouting {
    /// The fingerprint hash
    pub fingerprint_hash: String,
    /// Historical success rate of the serving endpoint, when known
    pub historical_success_rate: Option<f64>,
    /// Observations behind that rate
    pub sample_count: u64,
    /// Whether evidence demoted the original top candidate
    pub demoted: bool,
}

/// Timing breakdown of one query
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Performance {
    /// End-to-end time
    pub total_ms: u64,
    /// Time inside the winning endpoint attempt
    pub endpoint_ms: u64,
    /// Time spent selecting the route
    pub routing_ms: u64,
}

/// Classifier summary as surfaced to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationMeta {
    /// Intent label
    pub intent: Intent,
    /// Score, percent
    pub score_percent: u8,
    /// Fingerprint complexity, percent
    pub complexity_percent: u8,
}

/// Full metadata attached to a query response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Request correlation id
    pub request_id: RequestId,
    /// How the endpoint was chosen
    pub routing_decision: RoutingDecision,
    /// Learner context
    pub empirical_routing: EmpiricalRouting,
    /// Timing breakdown
    pub performance: Performance,
    /// Classifier summary
    pub classification: ClassificationMeta,
    /// Attempts, in order; more than one means failover
    pub attempts: Vec<ExecutionAttempt>,
    /// Whether the response came from the cache
    pub cache_hit: bool,
}

/// A completed query
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// The endpoint's raw response text
    pub response: String,
    /// Structured metadata
    pub metadata: QueryMetadata,
}

/// A failed query: the terminal error plus everything a caller is owed
#[derive(Debug, Clone)]
pub struct QueryFailure {
    /// The most informative terminal error
    pub error: RouteError,
    /// Attempts made before giving up; empty when nothing was attempted
    pub attempts: Vec<ExecutionAttempt>,
    /// Learner-derived suggestion for this category of query
    pub routing_hint: Option<String>,
}

impl From<RouteError> for QueryFailure {
    fn from(error: RouteError) -> Self {
        Self {
            error,
            attempts: Vec::new(),
            routing_hint: None,
        }
    }
}

/// Per-endpoint block in the status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// Endpoint name
    pub name: String,
    /// Local or cloud
    pub class: EndpointClass,
    /// Probe-derived health
    pub health: HealthState,
    /// Breaker state
    pub breaker_state: BreakerState,
    /// Selection priority
    pub priority: u8,
    /// Last observed latency
    pub last_latency_ms: Option<u64>,
    /// Lifetime breaker-counted failures
    pub failure_count: u64,
    /// Rolling counters
    pub counters: EndpointCounters,
}

/// Full status report for the `status` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Requests observed
    pub requests: u64,
    /// Per-endpoint state
    pub endpoints: Vec<EndpointStatus>,
    /// Cache counters
    pub cache: CacheStats,
    /// Observed local fraction over the balancer window
    pub observed_local_ratio: Option<f64>,
    /// Highest-volume fingerprints with success rates
    pub empirical_top: Vec<EmpiricalPattern>,
}

struct ProducedMetadata {
    plan_method: RouteMethod,
    reason_code: String,
    confidence_percent: u8,
    demoted: bool,
    attempts: Vec<ExecutionAttempt>,
    endpoint_ms: u64,
    routing_ms: u64,
}

/// The assembled router service
pub struct RouterService {
    config: RouterConfig,
    registry: Arc<EndpointRegistry>,
    router: SmartRouter,
    cache: ResponseCache,
    learner: Arc<EmpiricalLearner>,
    log: Arc<ExecutionLog>,
    executor: Executor,
    policy: PathPolicy,
    balancer_view: Arc<LocalFirstBalancer>,
    probe: Arc<dyn HealthProbe>,
    monitor_cancel: CancellationToken,
    hard_cancel: CancellationToken,
    tracker: TaskTracker,
    accepting: AtomicBool,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RouterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterService")
            .field("endpoints", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RouterService {
    /// Builds the service with HTTP backends for chat and health probing
    ///
    /// # Errors
    /// `RouteError::Config` for unusable configuration.
    pub fn new(config: RouterConfig) -> Result<Self, RouteError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| RouteError::Config {
                reason: format!("http client: {error}"),
            })?;
        Self::with_backends(
            config,
            Arc::new(HttpChatBackend::new(client.clone())),
            Arc::new(HttpHealthProbe::new(client)),
        )
    }

    /// Builds the service with injected backends; the seam used by tests
    ///
    /// # Errors
    /// `RouteError::Config` for unusable configuration.
    pub fn with_backends(
        config: RouterConfig,
        backend: Arc<dyn ChatBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, RouteError> {
        config.validate().map_err(RouteError::from)?;

        let breaker_settings = BreakerSettings {
            failure_threshold: config.breaker_failure_threshold.as_u32(),
            open_cooldown: config.breaker_open_ms.as_duration(),
            half_open_successes: config.breaker_halfopen_successes.as_u32(),
            window: config.breaker_window_ms.as_duration(),
        };
        let endpoints: Vec<Arc<Endpoint>> = config
            .endpoints
            .iter()
            .map(|endpoint_config| {
                endpoint_config
                    .to_descriptor()
                    .map(|descriptor| Arc::new(Endpoint::new(descriptor, breaker_settings)))
            })
            .collect::<Result<_, _>>()
            .map_err(RouteError::from)?;
        let registry = Arc::new(EndpointRegistry::new(endpoints)?);

        let learner = Arc::new(EmpiricalLearner::new(config.empirical_max_entries));
        if let Some(path) = &config.empirical_snapshot_path {
            learner.load_snapshot(path);
        }

        // The balancer is shared: the router records decisions, the status
        // surface reads the observed ratio.
        let balancer_view = Arc::new(LocalFirstBalancer::new(config.local_first_ratio));
        let router = SmartRouter::new(
            Arc::clone(&registry),
            Arc::clone(&balancer_view),
            Arc::clone(&learner),
            RouterSettings {
                base_timeout: config.request_timeout_base_ms,
                complex_multiplier: config.complex_multiplier,
                demote_threshold: config.empirical_demote_threshold,
                min_samples: config.empirical_min_samples,
            },
        );

        let log = Arc::new(ExecutionLog::new());
        let executor = Executor::new(
            backend,
            Arc::clone(&learner),
            Arc::clone(&log),
            RetryPolicy {
                attempts: config.retry_attempts,
                base: config.retry_base_ms,
                cap: config.retry_cap_ms,
            },
        );

        let cache = ResponseCache::new(
            config.cache_ttl_ms,
            config.cache_max_entries,
            config.cache_max_bytes,
        );
        let policy = PathPolicy::new(config.workspace_root.clone())?;

        Ok(Self {
            registry,
            router,
            cache,
            learner,
            log,
            executor,
            policy,
            balancer_view,
            probe,
            monitor_cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            monitor_handle: Mutex::new(None),
            config,
        })
    }

    /// Starts the background health monitor
    pub fn start(&self) {
        let handle = spawn_health_monitor(
            Arc::clone(&self.registry),
            Arc::clone(&self.probe),
            HealthMonitorSettings {
                interval: self.config.probe_interval_ms,
                timeout: self.config.probe_timeout_ms,
                unhealthy_after: self.config.breaker_failure_threshold,
            },
            self.monitor_cancel.clone(),
        );
        *self.monitor_handle.lock().expect("monitor handle poisoned") = Some(handle);
        info!(endpoints = self.registry.len(), "router service started");
    }

    /// The path policy, for the file tools
    #[must_use]
    pub fn path_policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// The endpoint registry
    #[must_use]
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Runs the file analysis pipeline under the configured limits
    pub async fn analyze_files(
        &self,
        inputs: &[String],
        max_files: Option<usize>,
        include_project_context: bool,
    ) -> AnalysisReport {
        let mut read = ReadOptions {
            max_file_bytes: self.config.max_file_bytes,
            max_files: self.config.max_files,
            concurrency: self.config.file_concurrency,
            read_timeout: self.config.file_read_timeout_ms.as_duration(),
            allowed_extensions: self
                .config
                .allowed_extensions
                .as_ref()
                .map(|extensions| extensions.iter().cloned().collect()),
        };
        if let Some(cap) = max_files
            && let Ok(bounded) = crate::domain_types::MaxFiles::try_new(
                cap.min(self.config.max_files.as_usize()),
            )
        {
            read.max_files = bounded;
        }
        let options = AnalysisOptions {
            read,
            chunker: crate::analysis::ChunkerLimits::default(),
            include_project_context,
        };
        analyze(&self.policy, inputs, &options).await
    }

    /// Routes and executes one request
    ///
    /// # Errors
    /// A [`QueryFailure`] wrapping a member of the closed error taxonomy,
    /// with the endpoints attempted and, when the learner has evidence, a
    /// routing hint.
    pub async fn query(&self, request: RouteRequest) -> Result<QueryOutcome, QueryFailure> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RouteError::Cancelled.into());
        }
        request.validate()?;
        self.log.record_request();

        let tracked = self.tracker.track_future(self.query_inner(request));
        tracked.await
    }

    async fn query_inner(&self, request: RouteRequest) -> Result<QueryOutcome, QueryFailure> {
        let total_started = Instant::now();
        let request_id = RequestId::generate();

        let fp = fingerprint(&request);
        let classification = classify::classify(&request.combined_text());

        // Effective deadline: the caller's cut-off, bounded by the configured
        // ceiling (the fully-scaled timeout with failover headroom).
        let ceiling = self
            .config
            .request_timeout_base_ms
            .as_duration()
            .mul_f64(self.config.complex_multiplier.as_f64())
            .saturating_mul(4);
        let deadline = match request.deadline {
            Some(explicit) => explicit.min(Instant::now() + ceiling),
            None => Instant::now() + ceiling,
        };
        let cancel = self.hard_cancel.child_token();

        // Cache check and single-flight produce in one step: a settled entry
        // returns immediately, a concurrent producer coalesces this caller,
        // and otherwise this caller becomes the producer. The leader deposits
        // its metadata in the side slot; hits and followers synthesize
        // cache-shaped metadata instead.
        let produced_meta: Mutex<Option<ProducedMetadata>> = Mutex::new(None);
        let failed_attempts: Mutex<Vec<ExecutionAttempt>> = Mutex::new(Vec::new());
        let produced = self
            .cache
            .get_or_compute(&fp.hash, async {
                let routing_started = Instant::now();
                let plan = self.router.route(&request, &fp, &classification)?;

                // File inputs are analyzed inside the flight so coalesced
                // callers share the work.
                let files: Vec<FileUnit> = if request.file_inputs.is_empty() {
                    Vec::new()
                } else {
                    self.analyze_files(&request.file_inputs, None, false).await.files
                };
                let top = &plan.candidates[0].descriptor;
                let assembled = assemble(&request.combined_text(), top, &files);
                #[allow(clippy::cast_possible_truncation)]
                let routing_ms = routing_started.elapsed().as_millis() as u64;

                let result = match self
                    .executor
                    .execute(&plan, &assembled.text, &fp.hash, Some(deadline), &cancel)
                    .await
                {
                    Ok(result) => result,
                    Err(failure) => {
                        *failed_attempts.lock().expect("attempt slot poisoned") =
                            failure.attempts;
                        return Err(failure.error);
                    }
                };

                let endpoint_ms = result
                    .attempts
                    .last()
                    .map_or(0, |attempt| attempt.duration_ms);
                let method = if result.attempts.len() > 1 {
                    RouteMethod::Failover
                } else {
                    plan.method
                };
                *produced_meta.lock().expect("meta slot poisoned") = Some(ProducedMetadata {
                    plan_method: method,
                    reason_code: plan.reason_code.clone(),
                    confidence_percent: plan.confidence_percent,
                    demoted: plan.demoted,
                    attempts: result.attempts.clone(),
                    endpoint_ms,
                    routing_ms,
                });

                Ok(CachedResponse {
                    response: result.response.content,
                    endpoint_used: result.endpoint_used,
                    completed_at: chrono::Utc::now(),
                    token_usage: result.response.token_usage,
                })
            })
            .await;

        let produced = match produced {
            Ok(produced) => produced,
            Err(error) => {
                let attempts = std::mem::take(
                    &mut *failed_attempts.lock().expect("attempt slot poisoned"),
                );
                let attempted: Vec<String> =
                    attempts.iter().map(|a| a.endpoint.clone()).collect();
                let routing_hint = self.routing_hint(&fp.hash, &attempted);
                return Err(QueryFailure {
                    error,
                    attempts,
                    routing_hint,
                });
            }
        };

        let meta = produced_meta.lock().expect("meta slot poisoned").take();
        #[allow(clippy::cast_possible_truncation)]
        let total_ms = total_started.elapsed().as_millis() as u64;

        match meta {
            Some(meta) => {
                let entry = self
                    .learner
                    .endpoint_entry(&fp.hash, &produced.endpoint_used);
                Ok(QueryOutcome {
                    response: produced.response.clone(),
                    metadata: QueryMetadata {
                        request_id,
                        routing_decision: RoutingDecision {
                            endpoint_used: produced.endpoint_used.as_str().to_string(),
                            reason_code: meta.reason_code,
                            confidence_percent: meta.confidence_percent,
                            method: meta.plan_method,
                        },
                        empirical_routing: EmpiricalRouting {
                            fingerprint_hash: fp.hash.clone(),
                            historical_success_rate: entry
                                .as_ref()
                                .map(crate::routing::empirical::EmpiricalEntry::success_rate),
                            sample_count: entry.map_or(0, |e| e.total),
                            demoted: meta.demoted,
                        },
                        performance: Performance {
                            total_ms,
                            endpoint_ms: meta.endpoint_ms,
                            routing_ms: meta.routing_ms,
                        },
                        classification: classification_meta(&classification, &fp),
                        attempts: meta.attempts,
                        cache_hit: false,
                    },
                })
            }
            // A coalesced follower: the response is shared, the metadata is
            // cache-shaped.
            None => Ok(self.cached_outcome(request_id, &fp, &classification, produced, total_started)),
        }
    }

    fn cached_outcome(
        &self,
        request_id: RequestId,
        fp: &Fingerprint,
        classification: &Classification,
        hit: CachedResponse,
        total_started: Instant,
    ) -> QueryOutcome {
        let entry = self.learner.endpoint_entry(&fp.hash, &hit.endpoint_used);
        #[allow(clippy::cast_possible_truncation)]
        let total_ms = total_started.elapsed().as_millis() as u64;
        QueryOutcome {
            response: hit.response.clone(),
            metadata: QueryMetadata {
                request_id,
                routing_decision: RoutingDecision {
                    endpoint_used: hit.endpoint_used.as_str().to_string(),
                    reason_code: "cache_hit".to_string(),
                    confidence_percent: 100,
                    method: RouteMethod::Direct,
                },
                empirical_routing: EmpiricalRouting {
                    fingerprint_hash: fp.hash.clone(),
                    historical_success_rate: entry
                        .as_ref()
                        .map(crate::routing::empirical::EmpiricalEntry::success_rate),
                    sample_count: entry.map_or(0, |e| e.total),
                    demoted: false,
                },
                performance: Performance {
                    total_ms,
                    endpoint_ms: 0,
                    routing_ms: 0,
                },
                classification: classification_meta(classification, fp),
                attempts: Vec::new(),
                cache_hit: true,
            },
        }
    }

    /// A "consider routing this category to ..." hint from the learner
    #[must_use]
    pub fn routing_hint(&self, fingerprint_hash: &str, attempted: &[String]) -> Option<String> {
        let attempted_names: Vec<crate::domain_types::EndpointName> = attempted
            .iter()
            .filter_map(|name| crate::domain_types::EndpointName::try_new(name.clone()).ok())
            .collect();
        let excluded: Vec<&crate::domain_types::EndpointName> = attempted_names.iter().collect();
        let (best, rate) = self.learner.best_alternative(
            fingerprint_hash,
            &excluded,
            self.config.empirical_min_samples,
        )?;
        Some(format!(
            "consider routing this category of query to '{best}' (historical success rate {:.0}%)",
            rate * 100.0
        ))
    }

    /// Assembles the status report
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let endpoints = self
            .registry
            .all()
            .iter()
            .map(|endpoint| {
                let runtime = endpoint.runtime_snapshot();
                EndpointStatus {
                    name: endpoint.descriptor.name.as_str().to_string(),
                    class: endpoint.descriptor.class,
                    health: runtime.health,
                    breaker_state: endpoint.breaker.state(),
                    priority: endpoint.descriptor.priority.as_u8(),
                    last_latency_ms: runtime.last_latency_ms,
                    failure_count: runtime.failure_count,
                    counters: self.log.endpoint_counters(&endpoint.descriptor.name),
                }
            })
            .collect();

        StatusReport {
            uptime_seconds: self.log.uptime_seconds(),
            requests: self.log.requests(),
            endpoints,
            cache: self.cache.stats(),
            observed_local_ratio: self.balancer_view.observed_local_ratio(),
            empirical_top: self.learner.top_patterns(10),
        }
    }

    /// Cache counters, for tests and tooling
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Graceful shutdown: refuse new work, drain, then abort stragglers
    pub async fn shutdown(&self) {
        info!("router service shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        self.monitor_cancel.cancel();

        self.tracker.close();
        let drained = tokio::time::timeout(
            self.config.drain_on_shutdown_ms.as_duration(),
            self.tracker.wait(),
        )
        .await;
        if drained.is_err() {
            warn!("drain window expired, aborting in-flight requests");
            self.hard_cancel.cancel();
            self.tracker.wait().await;
        }

        if let Some(handle) = self
            .monitor_handle
            .lock()
            .expect("monitor handle poisoned")
            .take()
        {
            let _ = handle.await;
        }

        if let Some(path) = &self.config.empirical_snapshot_path {
            if let Err(error) = self.learner.save_snapshot(path) {
                warn!(%error, "empirical snapshot failed");
            }
        }
        info!("router service stopped");
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn classification_meta(classification: &Classification, fp: &Fingerprint) -> ClassificationMeta {
    ClassificationMeta {
        intent: classification.intent,
        score_percent: (classification.score.as_f64() * 100.0).round() as u8,
        complexity_percent: (fp.complexity.as_f64() * 100.0).round() as u8,
    }
}
