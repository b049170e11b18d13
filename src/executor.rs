//! Request execution with retry and failover
//!
//! Walks the router's ordered candidates. Network failures retry on the
//! same endpoint with jittered backoff; everything else that can fail over
//! does; cancellation aborts immediately. Every attempt is recorded, fed to
//! the learner, and applied to the endpoint's breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TokenUsage;
use crate::domain_types::{EndpointName, RetryAttempts, RetryBaseMs, RetryCapMs};
use crate::error::{AttemptOutcome, RouteError};
use crate::routing::breaker::BreakerPermit;
use crate::routing::empirical::EmpiricalLearner;
use crate::routing::endpoint::{AuthPolicy, Endpoint, EndpointDescriptor};
use crate::routing::router::RoutePlan;
use crate::stats::ExecutionLog;

/// Sampling temperature sent on every outbound call
const TEMPERATURE: f64 = 0.2;

/// One outbound chat call
#[derive(Debug, Clone)]
pub struct ChatCall {
    /// The assembled prompt
    pub prompt: String,
    /// Response-token cap
    pub max_tokens: u32,
    /// Per-attempt timeout
    pub timeout: Duration,
}

/// A successful completion
#[derive(Debug, Clone)]
pub struct ChatSuccess {
    /// Response text
    pub content: String,
    /// Reported token usage
    pub token_usage: TokenUsage,
}

/// Seam for issuing one chat completion
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Executes one call against one endpoint
    ///
    /// # Errors
    /// One of the §7 execution errors: `Timeout`, `Capacity`,
    /// `Upstream5xx`, `Upstream4xx`, `Network`, or `Cancelled`.
    async fn complete(
        &self,
        endpoint: &EndpointDescriptor,
        call: &ChatCall,
        cancel: &CancellationToken,
    ) -> Result<ChatSuccess, RouteError>;
}

/// OpenAI-compatible HTTP backend
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
}

impl HttpChatBackend {
    /// Creates a backend around a shared HTTP client
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn classify_send_error(
        endpoint: &EndpointName,
        error: &reqwest::Error,
        elapsed: Duration,
    ) -> RouteError {
        if error.is_timeout() {
            RouteError::Timeout {
                endpoint: endpoint.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
            }
        } else {
            RouteError::Network {
                endpoint: endpoint.clone(),
                reason: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn complete(
        &self,
        endpoint: &EndpointDescriptor,
        call: &ChatCall,
        cancel: &CancellationToken,
    ) -> Result<ChatSuccess, RouteError> {
        let started = Instant::now();
        let body = json!({
            "model": endpoint.model.as_str(),
            "messages": [{ "role": "user", "content": call.prompt }],
            "temperature": TEMPERATURE,
            "max_tokens": call.max_tokens,
            "stream": false,
        });

        let mut request = self
            .client
            .post(endpoint.chat_url())
            .timeout(call.timeout)
            .json(&body);
        if let AuthPolicy::Bearer { .. } = &endpoint.auth
            && let Some(token) = endpoint.auth.bearer_token()
        {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(RouteError::Cancelled),
            response = request.send() => response
                .map_err(|error| Self::classify_send_error(&endpoint.name, &error, started.elapsed()))?,
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RouteError::Capacity {
                endpoint: endpoint.name.clone(),
            });
        }
        if status.is_server_error() {
            return Err(RouteError::Upstream5xx {
                endpoint: endpoint.name.clone(),
                status: status.as_u16(),
            });
        }
        if status.is_client_error() {
            return Err(RouteError::Upstream4xx {
                endpoint: endpoint.name.clone(),
                status: status.as_u16(),
            });
        }

        let payload: serde_json::Value = tokio::select! {
            () = cancel.cancelled() => return Err(RouteError::Cancelled),
            payload = response.json() => payload.map_err(|error| RouteError::Network {
                endpoint: endpoint.name.clone(),
                reason: format!("invalid response body: {error}"),
            })?,
        };

        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RouteError::Network {
                endpoint: endpoint.name.clone(),
                reason: "response missing choices[0].message.content".to_string(),
            })?
            .to_string();

        let usage = TokenUsage {
            prompt_tokens: read_u32(&payload, "/usage/prompt_tokens"),
            completion_tokens: read_u32(&payload, "/usage/completion_tokens"),
            total_tokens: read_u32(&payload, "/usage/total_tokens"),
        };

        Ok(ChatSuccess {
            content,
            token_usage: usage,
        })
    }
}

fn read_u32(payload: &serde_json::Value, pointer: &str) -> u32 {
    payload
        .pointer(pointer)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// One attempt, as surfaced in response metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// Endpoint attempted
    pub endpoint: String,
    /// Outcome
    pub outcome: AttemptOutcome,
    /// Attempt duration
    pub duration_ms: u64,
    /// Error text for failed attempts
    pub error: Option<String>,
}

/// A completed execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The winning response
    pub response: ChatSuccess,
    /// Which endpoint served it
    pub endpoint_used: EndpointName,
    /// Every attempt in order
    pub attempts: Vec<ExecutionAttempt>,
}

/// A failed execution, with the attempts that led to it
#[derive(Debug, Clone)]
pub struct ExecuteError {
    /// The most informative terminal error
    pub error: RouteError,
    /// Every attempt made before giving up
    pub attempts: Vec<ExecutionAttempt>,
}

/// Retry tuning
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Same-endpoint retries for network failures
    pub attempts: RetryAttempts,
    /// Base backoff
    pub base: RetryBaseMs,
    /// Backoff cap
    pub cap: RetryCapMs,
}

/// The execution engine
pub struct Executor {
    backend: Arc<dyn ChatBackend>,
    learner: Arc<EmpiricalLearner>,
    log: Arc<ExecutionLog>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor over a backend, learner, and log
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        learner: Arc<EmpiricalLearner>,
        log: Arc<ExecutionLog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            learner,
            log,
            retry,
        }
    }

    /// Executes the plan, walking candidates on failover
    ///
    /// # Errors
    /// `RouteError::Cancelled` as soon as the token fires; otherwise the
    /// most informative error once every candidate has failed. The error
    /// carries every attempt made so callers can surface them.
    pub async fn execute(
        &self,
        plan: &RoutePlan,
        prompt: &str,
        fingerprint_hash: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        let mut attempts: Vec<ExecutionAttempt> = Vec::new();
        let mut terminal: Option<RouteError> = None;

        for candidate in &plan.candidates {
            if cancel.is_cancelled() {
                return Err(ExecuteError {
                    error: RouteError::Cancelled,
                    attempts,
                });
            }
            let Some(permit) = candidate.breaker.try_acquire() else {
                debug!(
                    endpoint = candidate.descriptor.name.as_str(),
                    "breaker rejected candidate, skipping"
                );
                continue;
            };

            match self
                .try_endpoint(
                    candidate,
                    permit,
                    plan,
                    prompt,
                    fingerprint_hash,
                    deadline,
                    cancel,
                    &mut attempts,
                )
                .await
            {
                Ok(success) => {
                    return Ok(ExecutionResult {
                        response: success,
                        endpoint_used: candidate.descriptor.name.clone(),
                        attempts,
                    });
                }
                Err(error) if error.fast_fails() => {
                    return Err(ExecuteError { error, attempts });
                }
                Err(error) => {
                    terminal = Some(match terminal.take() {
                        Some(existing) => existing.more_informative(error),
                        None => error,
                    });
                }
            }
        }

        Err(ExecuteError {
            error: terminal.unwrap_or(RouteError::Config {
                reason: "no candidate endpoint accepted the request".to_string(),
            }),
            attempts,
        })
    }

    /// Runs one endpoint, including same-endpoint network retries
    #[allow(clippy::too_many_arguments)]
    async fn try_endpoint(
        &self,
        candidate: &Arc<Endpoint>,
        permit: BreakerPermit,
        plan: &RoutePlan,
        prompt: &str,
        fingerprint_hash: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        attempts: &mut Vec<ExecutionAttempt>,
    ) -> Result<ChatSuccess, RouteError> {
        let name = &candidate.descriptor.name;
        let mut retries_left = self.retry.attempts.as_u8();
        let mut retry_round = 0u32;

        loop {
            let timeout = match effective_timeout(plan.per_endpoint_timeout, deadline) {
                Some(timeout) => timeout,
                None => return Err(RouteError::Cancelled),
            };
            let call = ChatCall {
                prompt: prompt.to_string(),
                max_tokens: plan.response_max_tokens,
                timeout,
            };

            let started = Instant::now();
            let result = self
                .backend
                .complete(&candidate.descriptor, &call, cancel)
                .await;
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(success) => {
                    candidate.breaker.record_success();
                    candidate.record_call_latency(duration_ms);
                    self.learner.record(
                        fingerprint_hash,
                        name,
                        AttemptOutcome::Success,
                        duration_ms,
                    );
                    self.log.record_attempt(
                        fingerprint_hash,
                        name,
                        AttemptOutcome::Success,
                        duration_ms,
                        prompt.len() as u64,
                        success.content.len() as u64,
                    );
                    attempts.push(ExecutionAttempt {
                        endpoint: name.as_str().to_string(),
                        outcome: AttemptOutcome::Success,
                        duration_ms,
                        error: None,
                    });
                    info!(
                        endpoint = name.as_str(),
                        duration_ms, "endpoint served request"
                    );
                    return Ok(success);
                }
                Err(error) => {
                    let outcome = error.outcome();
                    self.learner.record(fingerprint_hash, name, outcome, duration_ms);
                    self.log.record_attempt(
                        fingerprint_hash,
                        name,
                        outcome,
                        duration_ms,
                        prompt.len() as u64,
                        0,
                    );
                    attempts.push(ExecutionAttempt {
                        endpoint: name.as_str().to_string(),
                        outcome,
                        duration_ms,
                        error: Some(error.to_string()),
                    });

                    if error.counts_against_breaker() {
                        candidate.breaker.record_failure();
                        candidate.record_counted_failure();
                    } else if permit == BreakerPermit::Probe {
                        // A non-counted failure must still return the probe
                        // slot it was holding.
                        candidate.breaker.release_probe();
                    }

                    if matches!(error, RouteError::Cancelled) {
                        return Err(RouteError::Cancelled);
                    }

                    let deadline_allows_retry = deadline
                        .is_none_or(|d| d.saturating_duration_since(Instant::now()) > Duration::ZERO);
                    if error.retryable_same_endpoint() && retries_left > 0 && deadline_allows_retry
                    {
                        retries_left -= 1;
                        retry_round += 1;
                        let backoff = self.backoff(retry_round);
                        warn!(
                            endpoint = name.as_str(),
                            backoff_ms = backoff.as_millis() as u64,
                            retries_left,
                            "network failure, retrying same endpoint"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => return Err(RouteError::Cancelled),
                            () = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }

                    warn!(
                        endpoint = name.as_str(),
                        error = %error,
                        "attempt failed, moving on"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Exponential backoff with jitter: `base * 2^(round-1)` capped, plus a
    /// random slice of the base
    fn backoff(&self, round: u32) -> Duration {
        let base = self.retry.base.as_u64();
        let cap = self.retry.cap.as_u64();
        let exponential = base.saturating_mul(1u64 << (round.saturating_sub(1)).min(10));
        let jitter = rand::rng().random_range(0..=base);
        Duration::from_millis(exponential.min(cap) + jitter)
    }
}

/// The smaller of the plan timeout and the remaining deadline; `None` when
/// the deadline is already exhausted
fn effective_timeout(per_endpoint: Duration, deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(per_endpoint),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                None
            } else {
                Some(per_endpoint.min(remaining))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_prefers_smaller() {
        let plan = Duration::from_secs(25);
        assert_eq!(effective_timeout(plan, None), Some(plan));

        let near = Instant::now() + Duration::from_secs(1);
        let effective = effective_timeout(plan, Some(near)).unwrap();
        assert!(effective <= Duration::from_secs(1));
    }

    #[test]
    fn test_exhausted_deadline_yields_none() {
        let past = Instant::now() - Duration::from_secs(1);
        assert_eq!(effective_timeout(Duration::from_secs(5), Some(past)), None);
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let executor_retry = RetryPolicy {
            attempts: RetryAttempts::default(),
            base: RetryBaseMs::try_new(100).unwrap(),
            cap: RetryCapMs::try_new(2000).unwrap(),
        };
        // Standalone check of the backoff arithmetic without a backend.
        let backoff = |round: u32| {
            let base = executor_retry.base.as_u64();
            let cap = executor_retry.cap.as_u64();
            base.saturating_mul(1u64 << (round.saturating_sub(1)).min(10)).min(cap)
        };
        assert_eq!(backoff(1), 100);
        assert_eq!(backoff(2), 200);
        assert_eq!(backoff(10), 2000);
    }
}
