//! Error types for the request router
//!
//! The taxonomy is closed: every failure a caller can observe is one of the
//! variants below. Policy hangs off the variant, not off string matching:
//! breaker accounting, same-endpoint retry, failover, and fast-fail are all
//! decided by the methods on [`RouteError`].

use thiserror::Error;

use crate::domain_types::EndpointName;

/// Closed error taxonomy for routing and execution
///
/// Clonable so coalesced cache waiters can all receive the leader's error.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    /// Caller-supplied constraint violated (missing prompt, bad argument)
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What the caller got wrong
        reason: String,
    },

    /// Safety check rejected a path
    #[error("path rejected: {path}: {reason}")]
    Rejected {
        /// The offending input path as supplied
        path: String,
        /// Which check failed
        reason: String,
    },

    /// A forced endpoint has an open breaker
    #[error("endpoint '{endpoint}' breaker is open")]
    EndpointOpen {
        /// The endpoint whose breaker is open
        endpoint: EndpointName,
    },

    /// Per-endpoint or deadline timeout
    #[error("endpoint '{endpoint}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// The endpoint that timed out
        endpoint: EndpointName,
        /// Elapsed time when the timeout fired
        elapsed_ms: u64,
    },

    /// Upstream returned 429 or a capacity-equivalent refusal
    #[error("endpoint '{endpoint}' is at capacity")]
    Capacity {
        /// The refusing endpoint
        endpoint: EndpointName,
    },

    /// 5xx from the endpoint
    #[error("endpoint '{endpoint}' returned server error {status}")]
    Upstream5xx {
        /// The failing endpoint
        endpoint: EndpointName,
        /// HTTP status code
        status: u16,
    },

    /// Non-429 4xx from the endpoint
    #[error("endpoint '{endpoint}' rejected the request with status {status}")]
    Upstream4xx {
        /// The rejecting endpoint
        endpoint: EndpointName,
        /// HTTP status code
        status: u16,
    },

    /// Connection refused, DNS, TLS, read reset
    #[error("network error talking to '{endpoint}': {reason}")]
    Network {
        /// The unreachable endpoint
        endpoint: EndpointName,
        /// Transport-level detail
        reason: String,
    },

    /// Deadline or explicit cancellation fired
    #[error("request cancelled")]
    Cancelled,

    /// Configuration unusable
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong with the configuration
        reason: String,
    },
}

/// Discriminant of [`RouteError`], used in structured metadata and records
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// `RouteError::InvalidRequest`
    InvalidRequest,
    /// `RouteError::Rejected`
    Rejected,
    /// `RouteError::EndpointOpen`
    EndpointOpen,
    /// `RouteError::Timeout`
    Timeout,
    /// `RouteError::Capacity`
    Capacity,
    /// `RouteError::Upstream5xx`
    Upstream5xx,
    /// `RouteError::Upstream4xx`
    Upstream4xx,
    /// `RouteError::Network`
    Network,
    /// `RouteError::Cancelled`
    Cancelled,
    /// `RouteError::Config`
    Config,
}

/// Outcome recorded per execution attempt
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The endpoint returned a usable response
    Success,
    /// The attempt timed out
    Timeout,
    /// The endpoint refused for capacity (429-equivalent)
    Capacity,
    /// Transport failure
    Network,
    /// A policy decision prevented or rejected the call (4xx, open breaker)
    Policy,
    /// The request was cancelled mid-attempt
    Cancelled,
    /// Anything else
    Other,
}

impl RouteError {
    /// Returns the taxonomy discriminant
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::EndpointOpen { .. } => ErrorKind::EndpointOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::Upstream5xx { .. } => ErrorKind::Upstream5xx,
            Self::Upstream4xx { .. } => ErrorKind::Upstream4xx,
            Self::Network { .. } => ErrorKind::Network,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Maps this error to the attempt-record outcome
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Timeout { .. } => AttemptOutcome::Timeout,
            Self::Capacity { .. } => AttemptOutcome::Capacity,
            Self::Network { .. } => AttemptOutcome::Network,
            Self::Upstream4xx { .. } | Self::EndpointOpen { .. } => AttemptOutcome::Policy,
            Self::Cancelled => AttemptOutcome::Cancelled,
            _ => AttemptOutcome::Other,
        }
    }

    /// Whether this failure counts against the endpoint's breaker
    ///
    /// Only timeouts, 5xx responses, connection errors, and 429 count.
    #[must_use]
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Capacity { .. } | Self::Upstream5xx { .. } | Self::Network { .. }
        )
    }

    /// Whether the executor may retry this failure on the same endpoint
    #[must_use]
    pub fn retryable_same_endpoint(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether the executor should move on to the next candidate
    #[must_use]
    pub fn fails_over(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Capacity { .. }
                | Self::Upstream5xx { .. }
                | Self::Upstream4xx { .. }
                | Self::Network { .. }
        )
    }

    /// Whether the error terminates the request without failover
    #[must_use]
    pub fn fast_fails(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::EndpointOpen { .. }
                | Self::InvalidRequest { .. }
                | Self::Rejected { .. }
        )
    }

    /// Informativeness rank used when all candidates fail
    ///
    /// Timeouts take precedence over networking, which takes precedence over
    /// 4xx, which takes precedence over anything generic.
    #[must_use]
    pub fn informativeness(&self) -> u8 {
        match self {
            Self::Timeout { .. } => 4,
            Self::Network { .. } => 3,
            Self::Capacity { .. } | Self::Upstream5xx { .. } => 2,
            Self::Upstream4xx { .. } => 1,
            _ => 0,
        }
    }

    /// Keeps whichever of two terminal errors is more informative
    #[must_use]
    pub fn more_informative(self, other: Self) -> Self {
        if other.informativeness() > self.informativeness() {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> EndpointName {
        EndpointName::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn test_breaker_accounting_policy() {
        assert!(
            RouteError::Timeout {
                endpoint: name("local"),
                elapsed_ms: 25_000,
            }
            .counts_against_breaker()
        );
        assert!(RouteError::Capacity { endpoint: name("local") }.counts_against_breaker());
        assert!(
            RouteError::Upstream5xx {
                endpoint: name("local"),
                status: 503,
            }
            .counts_against_breaker()
        );
        // Non-429 4xx never counts.
        assert!(
            !RouteError::Upstream4xx {
                endpoint: name("local"),
                status: 400,
            }
            .counts_against_breaker()
        );
        assert!(!RouteError::Cancelled.counts_against_breaker());
    }

    #[test]
    fn test_only_network_errors_retry_in_place() {
        let net = RouteError::Network {
            endpoint: name("local"),
            reason: "connection refused".to_string(),
        };
        assert!(net.retryable_same_endpoint());
        let timeout = RouteError::Timeout {
            endpoint: name("local"),
            elapsed_ms: 100,
        };
        assert!(!timeout.retryable_same_endpoint());
    }

    #[test]
    fn test_informativeness_ordering() {
        let timeout = RouteError::Timeout {
            endpoint: name("a"),
            elapsed_ms: 1,
        };
        let net = RouteError::Network {
            endpoint: name("b"),
            reason: "reset".to_string(),
        };
        let picked = net.more_informative(timeout);
        assert_eq!(picked.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_fast_fail_set() {
        assert!(RouteError::Cancelled.fast_fails());
        assert!(RouteError::EndpointOpen { endpoint: name("x") }.fast_fails());
        assert!(
            !RouteError::Network {
                endpoint: name("x"),
                reason: String::new(),
            }
            .fast_fails()
        );
    }
}
