//! Router configuration
//!
//! Environment-first over a closed key set, with JSON file loading, presets
//! for development, production, and testing, a builder for custom setups,
//! and validation that catches inconsistent values before anything starts.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{
    BreakerOpenMs, BreakerWindowMs, CacheMaxBytes, CacheMaxEntries, CacheTtlMs,
    ComplexMultiplier, ContextTokens, DrainMs, EmpiricalDemoteThreshold, EmpiricalMaxEntries,
    EmpiricalMinSamples, EndpointName, FailureThreshold, FileConcurrency, FileReadTimeoutMs,
    HalfOpenSuccesses, LocalFirstRatio, MaxFileBytes, MaxFiles, ModelId, PriorityRank,
    ProbeIntervalMs, ProbeTimeoutMs, RequestTimeoutMs, RetryAttempts, RetryBaseMs, RetryCapMs,
    ResponseTokens,
};
use crate::error::RouteError;
use crate::routing::endpoint::{AuthPolicy, Capability, EndpointClass, EndpointDescriptor};

/// Environment variable prefix for every recognized key
const ENV_PREFIX: &str = "LODESTAR_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError {
        /// The offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// File I/O failed
    #[error("I/O error: {source}")]
    IoError {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed
    #[error("serialization error: {source}")]
    SerializationError {
        /// Underlying error
        #[from]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for RouteError {
    fn from(error: ConfigError) -> Self {
        Self::Config {
            reason: error.to_string(),
        }
    }
}

/// Authentication kind in endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// No authentication
    #[default]
    None,
    /// Bearer token, read from the environment variable in `auth_secret_ref`
    Bearer,
}

/// One endpoint as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name
    pub name: String,
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Model id sent on every call
    pub model: String,
    /// Local or cloud; inferred from the URL host when omitted
    #[serde(default)]
    pub class: Option<EndpointClass>,
    /// Selection priority, smaller preferred
    #[serde(default)]
    pub priority: Option<u8>,
    /// Context window in estimated tokens
    #[serde(default)]
    pub max_context_tokens: Option<u32>,
    /// Response budget in estimated tokens
    #[serde(default)]
    pub max_response_tokens: Option<u32>,
    /// Authentication kind
    #[serde(default)]
    pub auth_kind: AuthKind,
    /// Environment variable holding the bearer secret
    #[serde(default)]
    pub auth_secret_ref: Option<String>,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Explicit health URL
    #[serde(default)]
    pub health_url: Option<String>,
}

impl EndpointConfig {
    /// Converts the configured form into a validated descriptor
    ///
    /// # Errors
    /// `ConfigError::ValidationError` for out-of-range values or a bearer
    /// endpoint without a secret reference.
    pub fn to_descriptor(&self) -> Result<EndpointDescriptor, ConfigError> {
        let name = EndpointName::try_new(self.name.clone()).map_err(|e| {
            ConfigError::ValidationError {
                field: "endpoints.name".to_string(),
                reason: e.to_string(),
            }
        })?;
        let model = ModelId::try_new(self.model.clone()).map_err(|e| {
            ConfigError::ValidationError {
                field: "endpoints.model".to_string(),
                reason: e.to_string(),
            }
        })?;
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::ValidationError {
                field: "endpoints.base_url".to_string(),
                reason: format!("'{}' must start with http:// or https://", self.base_url),
            });
        }

        let class = self.class.unwrap_or_else(|| infer_class(&self.base_url));
        let priority = match self.priority {
            Some(value) => PriorityRank::try_new(value).map_err(|e| {
                ConfigError::ValidationError {
                    field: "endpoints.priority".to_string(),
                    reason: e.to_string(),
                }
            })?,
            None => PriorityRank::default(),
        };
        let max_context_tokens = match self.max_context_tokens {
            Some(value) => ContextTokens::try_new(value).map_err(|e| {
                ConfigError::ValidationError {
                    field: "endpoints.max_context_tokens".to_string(),
                    reason: e.to_string(),
                }
            })?,
            None => ContextTokens::default(),
        };
        let max_response_tokens = match self.max_response_tokens {
            Some(value) => ResponseTokens::try_new(value).map_err(|e| {
                ConfigError::ValidationError {
                    field: "endpoints.max_response_tokens".to_string(),
                    reason: e.to_string(),
                }
            })?,
            None => ResponseTokens::default(),
        };

        let auth = match self.auth_kind {
            AuthKind::None => AuthPolicy::None,
            AuthKind::Bearer => {
                let secret_env = self.auth_secret_ref.clone().ok_or_else(|| {
                    ConfigError::ValidationError {
                        field: "endpoints.auth_secret_ref".to_string(),
                        reason: format!("endpoint '{}' uses bearer auth without a secret reference", self.name),
                    }
                })?;
                AuthPolicy::Bearer { secret_env }
            }
        };

        Ok(EndpointDescriptor {
            name,
            base_url: self.base_url.clone(),
            model,
            class,
            max_context_tokens,
            max_response_tokens,
            priority,
            auth,
            capabilities: self.capabilities.iter().copied().collect::<BTreeSet<_>>(),
            health_url: self.health_url.clone(),
        })
    }
}

fn infer_class(base_url: &str) -> EndpointClass {
    let lowered = base_url.to_ascii_lowercase();
    if lowered.contains("localhost")
        || lowered.contains("127.0.0.1")
        || lowered.contains("0.0.0.0")
        || lowered.contains("host.docker.internal")
    {
        EndpointClass::Local
    } else {
        EndpointClass::Cloud
    }
}

/// Complete router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Configured endpoints
    pub endpoints: Vec<EndpointConfig>,

    // Routing
    /// Target local traffic fraction
    pub local_first_ratio: LocalFirstRatio,
    /// Base per-endpoint timeout
    pub request_timeout_base_ms: RequestTimeoutMs,
    /// Timeout multiplier at full complexity
    pub complex_multiplier: ComplexMultiplier,

    // Health monitoring
    /// Probe interval
    pub probe_interval_ms: ProbeIntervalMs,
    /// Per-probe timeout
    pub probe_timeout_ms: ProbeTimeoutMs,

    // Circuit breaker
    /// Consecutive failures that open a breaker
    pub breaker_failure_threshold: FailureThreshold,
    /// Open cooldown
    pub breaker_open_ms: BreakerOpenMs,
    /// Half-open successes required to close
    pub breaker_halfopen_successes: HalfOpenSuccesses,
    /// Failure-streak window
    pub breaker_window_ms: BreakerWindowMs,

    // Cache
    /// Entry time-to-live
    pub cache_ttl_ms: CacheTtlMs,
    /// Byte cap
    pub cache_max_bytes: CacheMaxBytes,
    /// Entry cap
    pub cache_max_entries: CacheMaxEntries,

    // File pipeline
    /// Per-file byte cap
    pub max_file_bytes: MaxFileBytes,
    /// Files per request
    pub max_files: MaxFiles,
    /// Concurrent reads
    pub file_concurrency: FileConcurrency,
    /// Per-file timeout without a request deadline
    pub file_read_timeout_ms: FileReadTimeoutMs,
    /// Extension allowlist override; `None` uses the built-in set
    pub allowed_extensions: Option<Vec<String>>,
    /// Workspace root every path must resolve under
    pub workspace_root: PathBuf,

    // Retry
    /// Same-endpoint network retries
    pub retry_attempts: RetryAttempts,
    /// Base backoff
    pub retry_base_ms: RetryBaseMs,
    /// Backoff cap
    pub retry_cap_ms: RetryCapMs,

    // Lifecycle
    /// Drain window on shutdown
    pub drain_on_shutdown_ms: DrainMs,

    // Empirical learner
    /// Demotion success-rate floor
    pub empirical_demote_threshold: EmpiricalDemoteThreshold,
    /// Observations before evidence is trusted
    pub empirical_min_samples: EmpiricalMinSamples,
    /// Learner table cap
    pub empirical_max_entries: EmpiricalMaxEntries,
    /// Optional snapshot path, written on clean shutdown
    pub empirical_snapshot_path: Option<PathBuf>,
}

impl RouterConfig {
    /// Development defaults: short windows, local workspace, no snapshot
    #[must_use]
    pub fn development() -> Self {
        Self {
            endpoints: Vec::new(),
            local_first_ratio: LocalFirstRatio::default(),
            request_timeout_base_ms: RequestTimeoutMs::default(),
            complex_multiplier: ComplexMultiplier::default(),
            probe_interval_ms: ProbeIntervalMs::try_new(10_000).unwrap(),
            probe_timeout_ms: ProbeTimeoutMs::default(),
            breaker_failure_threshold: FailureThreshold::try_new(3).unwrap(),
            breaker_open_ms: BreakerOpenMs::try_new(30_000).unwrap(),
            breaker_halfopen_successes: HalfOpenSuccesses::default(),
            breaker_window_ms: BreakerWindowMs::default(),
            cache_ttl_ms: CacheTtlMs::try_new(300_000).unwrap(),
            cache_max_bytes: CacheMaxBytes::try_new(16_777_216).unwrap(),
            cache_max_entries: CacheMaxEntries::try_new(256).unwrap(),
            max_file_bytes: MaxFileBytes::default(),
            max_files: MaxFiles::default(),
            file_concurrency: FileConcurrency::default(),
            file_read_timeout_ms: FileReadTimeoutMs::default(),
            allowed_extensions: None,
            workspace_root: PathBuf::from("/workspace"),
            retry_attempts: RetryAttempts::default(),
            retry_base_ms: RetryBaseMs::default(),
            retry_cap_ms: RetryCapMs::default(),
            drain_on_shutdown_ms: DrainMs::default(),
            empirical_demote_threshold: EmpiricalDemoteThreshold::default(),
            empirical_min_samples: EmpiricalMinSamples::default(),
            empirical_max_entries: EmpiricalMaxEntries::default(),
            empirical_snapshot_path: None,
        }
    }

    /// Production defaults: standard operational windows, snapshot enabled
    #[must_use]
    pub fn production() -> Self {
        Self {
            probe_interval_ms: ProbeIntervalMs::default(),
            breaker_failure_threshold: FailureThreshold::default(),
            breaker_open_ms: BreakerOpenMs::default(),
            cache_ttl_ms: CacheTtlMs::default(),
            cache_max_bytes: CacheMaxBytes::default(),
            cache_max_entries: CacheMaxEntries::default(),
            empirical_snapshot_path: Some(PathBuf::from("./data/empirical.json")),
            ..Self::development()
        }
    }

    /// Testing defaults: tiny windows so tests run fast
    #[must_use]
    pub fn testing() -> Self {
        Self {
            probe_interval_ms: ProbeIntervalMs::try_new(1000).unwrap(),
            probe_timeout_ms: ProbeTimeoutMs::try_new(500).unwrap(),
            breaker_failure_threshold: FailureThreshold::try_new(2).unwrap(),
            breaker_open_ms: BreakerOpenMs::try_new(1000).unwrap(),
            breaker_window_ms: BreakerWindowMs::try_new(1000).unwrap(),
            cache_ttl_ms: CacheTtlMs::try_new(5000).unwrap(),
            cache_max_entries: CacheMaxEntries::try_new(64).unwrap(),
            retry_base_ms: RetryBaseMs::try_new(10).unwrap(),
            retry_cap_ms: RetryCapMs::try_new(100).unwrap(),
            drain_on_shutdown_ms: DrainMs::try_new(500).unwrap(),
            ..Self::development()
        }
    }

    /// Builder starting from development defaults
    #[must_use]
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::new()
    }

    /// Loads configuration from the environment over development defaults
    ///
    /// Recognized keys are the closed `LODESTAR_*` set; endpoints come from
    /// `LODESTAR_ENDPOINTS` as a JSON array of endpoint objects.
    ///
    /// # Errors
    /// `ConfigError` for unparsable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::development();

        if let Some(raw) = read_env("ENDPOINTS") {
            config.endpoints = serde_json::from_str(&raw)?;
        }
        if let Some(value) = parse_env::<f64>("LOCAL_FIRST_RATIO")? {
            config.local_first_ratio = try_field("local_first_ratio", LocalFirstRatio::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("REQUEST_TIMEOUT_BASE_MS")? {
            config.request_timeout_base_ms =
                try_field("request_timeout_base_ms", RequestTimeoutMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<f64>("COMPLEX_MULTIPLIER")? {
            config.complex_multiplier =
                try_field("complex_multiplier", ComplexMultiplier::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("PROBE_INTERVAL_MS")? {
            config.probe_interval_ms = try_field("probe_interval_ms", ProbeIntervalMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("PROBE_TIMEOUT_MS")? {
            config.probe_timeout_ms = try_field("probe_timeout_ms", ProbeTimeoutMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u32>("BREAKER_FAILURE_THRESHOLD")? {
            config.breaker_failure_threshold =
                try_field("breaker_failure_threshold", FailureThreshold::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("BREAKER_OPEN_MS")? {
            config.breaker_open_ms = try_field("breaker_open_ms", BreakerOpenMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u32>("BREAKER_HALFOPEN_SUCCESSES")? {
            config.breaker_halfopen_successes = try_field(
                "breaker_halfopen_successes",
                HalfOpenSuccesses::try_new(value),
            )?;
        }
        if let Some(value) = parse_env::<u64>("BREAKER_WINDOW_MS")? {
            config.breaker_window_ms = try_field("breaker_window_ms", BreakerWindowMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("CACHE_TTL_MS")? {
            config.cache_ttl_ms = try_field("cache_ttl_ms", CacheTtlMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("CACHE_MAX_BYTES")? {
            config.cache_max_bytes = try_field("cache_max_bytes", CacheMaxBytes::try_new(value))?;
        }
        if let Some(value) = parse_env::<usize>("CACHE_MAX_ENTRIES")? {
            config.cache_max_entries = try_field("cache_max_entries", CacheMaxEntries::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("MAX_FILE_BYTES")? {
            config.max_file_bytes = try_field("max_file_bytes", MaxFileBytes::try_new(value))?;
        }
        if let Some(value) = parse_env::<usize>("MAX_FILES")? {
            config.max_files = try_field("max_files", MaxFiles::try_new(value))?;
        }
        if let Some(value) = parse_env::<usize>("FILE_CONCURRENCY")? {
            config.file_concurrency = try_field("file_concurrency", FileConcurrency::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("FILE_READ_TIMEOUT_MS")? {
            config.file_read_timeout_ms =
                try_field("file_read_timeout_ms", FileReadTimeoutMs::try_new(value))?;
        }
        if let Some(raw) = read_env("ALLOWED_EXTENSIONS") {
            config.allowed_extensions = Some(
                raw.split(',')
                    .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect(),
            );
        }
        if let Some(raw) = read_env("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(raw);
        }
        if let Some(value) = parse_env::<u8>("RETRY_ATTEMPTS")? {
            config.retry_attempts = try_field("retry_attempts", RetryAttempts::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("RETRY_BASE_MS")? {
            config.retry_base_ms = try_field("retry_base_ms", RetryBaseMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("RETRY_CAP_MS")? {
            config.retry_cap_ms = try_field("retry_cap_ms", RetryCapMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<u64>("DRAIN_ON_SHUTDOWN_MS")? {
            config.drain_on_shutdown_ms = try_field("drain_on_shutdown_ms", DrainMs::try_new(value))?;
        }
        if let Some(value) = parse_env::<f64>("EMPIRICAL_DEMOTE_THRESHOLD")? {
            config.empirical_demote_threshold = try_field(
                "empirical_demote_threshold",
                EmpiricalDemoteThreshold::try_new(value),
            )?;
        }
        if let Some(value) = parse_env::<u64>("EMPIRICAL_MIN_SAMPLES")? {
            config.empirical_min_samples =
                try_field("empirical_min_samples", EmpiricalMinSamples::try_new(value))?;
        }
        if let Some(value) = parse_env::<usize>("EMPIRICAL_MAX_ENTRIES")? {
            config.empirical_max_entries =
                try_field("empirical_max_entries", EmpiricalMaxEntries::try_new(value))?;
        }
        if let Some(raw) = read_env("EMPIRICAL_SNAPSHOT_PATH") {
            config.empirical_snapshot_path = Some(PathBuf::from(raw));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field consistency
    ///
    /// # Errors
    /// `ConfigError::ValidationError` naming the first inconsistent field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for endpoint in &self.endpoints {
            endpoint.to_descriptor()?;
            if !names.insert(endpoint.name.clone()) {
                return Err(ConfigError::ValidationError {
                    field: "endpoints".to_string(),
                    reason: format!("duplicate endpoint name '{}'", endpoint.name),
                });
            }
        }

        if self.retry_base_ms.as_u64() > self.retry_cap_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "retry_base_ms".to_string(),
                reason: "must not exceed retry_cap_ms".to_string(),
            });
        }

        if self.file_concurrency.as_usize() > num_cpus::get() * 2 {
            return Err(ConfigError::ValidationError {
                field: "file_concurrency".to_string(),
                reason: format!("should not exceed 2x CPU cores ({})", num_cpus::get() * 2),
            });
        }

        if !self.workspace_root.is_absolute() {
            return Err(ConfigError::ValidationError {
                field: "workspace_root".to_string(),
                reason: "must be an absolute path".to_string(),
            });
        }

        let retry_budget = self.retry_cap_ms.as_u64() * u64::from(self.retry_attempts.as_u8());
        if retry_budget >= self.request_timeout_base_ms.as_u64() * 3 {
            return Err(ConfigError::ValidationError {
                field: "retry_cap_ms".to_string(),
                reason: "total retry budget dwarfs the request timeout".to_string(),
            });
        }

        Ok(())
    }

    /// Saves configuration to a JSON file
    ///
    /// # Errors
    /// `ConfigError` on I/O or serialization failure.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates configuration from a JSON file
    ///
    /// # Errors
    /// `ConfigError` on I/O, parse, or validation failure.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::development()
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match read_env(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|error| {
            ConfigError::ValidationError {
                field: format!("{ENV_PREFIX}{key}"),
                reason: format!("'{raw}' does not parse: {error}"),
            }
        }),
    }
}

fn try_field<T, E: std::fmt::Display>(field: &str, result: Result<T, E>) -> Result<T, ConfigError> {
    result.map_err(|error| ConfigError::ValidationError {
        field: field.to_string(),
        reason: error.to_string(),
    })
}

/// Builder for custom configurations
#[derive(Debug)]
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    /// Starts from development defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RouterConfig::development(),
        }
    }

    /// Sets the endpoint list
    #[must_use]
    pub fn endpoints(mut self, endpoints: Vec<EndpointConfig>) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    /// Sets the local-first ratio
    #[must_use]
    pub fn local_first_ratio(mut self, ratio: LocalFirstRatio) -> Self {
        self.config.local_first_ratio = ratio;
        self
    }

    /// Sets the base request timeout
    #[must_use]
    pub fn request_timeout_base_ms(mut self, timeout: RequestTimeoutMs) -> Self {
        self.config.request_timeout_base_ms = timeout;
        self
    }

    /// Sets the breaker failure threshold
    #[must_use]
    pub fn breaker_failure_threshold(mut self, threshold: FailureThreshold) -> Self {
        self.config.breaker_failure_threshold = threshold;
        self
    }

    /// Sets the breaker cooldown
    #[must_use]
    pub fn breaker_open_ms(mut self, cooldown: BreakerOpenMs) -> Self {
        self.config.breaker_open_ms = cooldown;
        self
    }

    /// Sets the cache TTL
    #[must_use]
    pub fn cache_ttl_ms(mut self, ttl: CacheTtlMs) -> Self {
        self.config.cache_ttl_ms = ttl;
        self
    }

    /// Sets the workspace root
    #[must_use]
    pub fn workspace_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.workspace_root = root.into();
        self
    }

    /// Sets the retry attempts
    #[must_use]
    pub fn retry_attempts(mut self, attempts: RetryAttempts) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Sets the empirical snapshot path
    #[must_use]
    pub fn empirical_snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.empirical_snapshot_path = Some(path.into());
        self
    }

    /// Builds and validates the configuration
    ///
    /// # Errors
    /// `ConfigError` when validation fails.
    pub fn build(self) -> Result<RouterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RouterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
