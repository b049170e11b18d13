//! # Lodestar - AI Request Router
//!
//! Lodestar sits between an MCP tool caller and a heterogeneous pool of LLM
//! inference endpoints: locally-hosted model servers and remote cloud
//! providers. It fingerprints and classifies each request, selects an
//! endpoint under a local-first policy informed by health, breakers, and
//! empirical evidence, executes with timeouts, retry, and failover, and
//! serves repeat requests from a single-flight cache.
//!
//! ## Architecture
//!
//! - **Routing**: endpoint registry, background health monitor, per-endpoint
//!   circuit breakers, a windowed local-first balancer, and an empirical
//!   learner that reorders (never vetoes) candidates.
//! - **Execution**: an OpenAI-compatible HTTP backend behind a seam, with
//!   jittered same-endpoint retries for network failures and ordered
//!   failover for everything else.
//! - **Cache**: fingerprint-keyed, TTL-bounded, LRU-capped, single-flight.
//! - **File analysis**: safe path resolution, bounded concurrent reads,
//!   regex structure extraction, semantic chunking, prompt assembly.
//! - **Tools**: a closed sum type (`query`, `analyze_files`, `status`,
//!   `compare`, `diagnose_file_access`) with per-variant handlers; MCP
//!   framing stays outside this crate.

pub mod analysis;
pub mod cache;
pub mod classify;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod request;
pub mod routing;
pub mod service;
pub mod stats;
pub mod tools;

pub use crate::cache::{CacheStats, CachedResponse, ResponseCache, TokenUsage};
pub use crate::classify::{Classification, Intent, classify};
pub use crate::config::{AuthKind, ConfigError, EndpointConfig, RouterConfig};
pub use crate::domain_types::{EndpointName, RequestId};
pub use crate::error::{AttemptOutcome, ErrorKind, RouteError};
pub use crate::executor::{ChatBackend, ChatCall, ChatSuccess, ExecutionAttempt, Executor};
pub use crate::fingerprint::{Domain, Fingerprint, QuestionType, fingerprint};
pub use crate::request::{RouteRequest, TaskHint};
pub use crate::service::{QueryFailure, QueryOutcome, RouterService, StatusReport};
pub use crate::tools::{ToolFailure, ToolRequest, ToolResponse, handle};
