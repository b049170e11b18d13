//! Domain types for the request router
//!
//! Strongly-typed domain values for routing, health, caching, and the file
//! pipeline to prevent primitive obsession and keep configuration values in
//! their valid ranges.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a routed request
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random request ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name of a configured inference endpoint
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct EndpointName(String);

impl EndpointName {
    /// Borrows the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Model identifier sent in the outbound request body
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct ModelId(String);

impl ModelId {
    /// Borrows the model id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Endpoint selection priority; smaller values are preferred
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct PriorityRank(u8);

impl PriorityRank {
    /// Gets the value as u8
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Maximum context window of an endpoint, in estimated tokens
#[nutype(
    validate(greater_or_equal = 256, less_or_equal = 4_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 32_768
)]
pub struct ContextTokens(u32);

impl ContextTokens {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Maximum response budget of an endpoint, in estimated tokens
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4096
)]
pub struct ResponseTokens(u32);

impl ResponseTokens {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Target fraction of traffic served by local endpoints (0.0 to 1.0)
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.95
)]
pub struct LocalFirstRatio(f64);

impl LocalFirstRatio {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Base per-endpoint request timeout in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 25_000
)]
pub struct RequestTimeoutMs(u64);

impl RequestTimeoutMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }

    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Upper multiplier applied to the base timeout for fully complex requests
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 10.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3.0
)]
pub struct ComplexMultiplier(f64);

impl ComplexMultiplier {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Health probe interval in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct ProbeIntervalMs(u64);

impl ProbeIntervalMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Per-probe timeout in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5000
)]
pub struct ProbeTimeoutMs(u64);

impl ProbeTimeoutMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Consecutive failures before a breaker opens
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct FailureThreshold(u32);

impl FailureThreshold {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Cooldown before an open breaker admits half-open probes, in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct BreakerOpenMs(u64);

impl BreakerOpenMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Consecutive half-open successes required to close a breaker
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct HalfOpenSuccesses(u32);

impl HalfOpenSuccesses {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Window within which a consecutive-failure streak keeps accumulating
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct BreakerWindowMs(u64);

impl BreakerWindowMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Cache entry time-to-live in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 900_000
)]
pub struct CacheTtlMs(u64);

impl CacheTtlMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Byte cap on cached response bodies
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 1_073_741_824),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 67_108_864
)]
pub struct CacheMaxBytes(u64);

impl CacheMaxBytes {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Entry cap on the cache
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct CacheMaxEntries(usize);

impl CacheMaxEntries {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Per-file byte cap for the analysis pipeline
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 104_857_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_485_760
)]
pub struct MaxFileBytes(u64);

impl MaxFileBytes {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Per-request cap on analyzed files
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 50),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 50
)]
pub struct MaxFiles(usize);

impl MaxFiles {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Concurrent file reads per analysis batch
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct FileConcurrency(usize);

impl FileConcurrency {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Per-file read timeout when the request carries no deadline
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5000
)]
pub struct FileReadTimeoutMs(u64);

impl FileReadTimeoutMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Same-endpoint retry attempts for network failures
#[nutype(
    validate(less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2
)]
pub struct RetryAttempts(u8);

impl RetryAttempts {
    /// Gets the value as u8
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Base retry backoff in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct RetryBaseMs(u64);

impl RetryBaseMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Retry backoff cap in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2000
)]
pub struct RetryCapMs(u64);

impl RetryCapMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Bounded drain window for graceful shutdown, in milliseconds
#[nutype(
    validate(less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3000
)]
pub struct DrainMs(u64);

impl DrainMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Success-rate floor below which the learner demotes a candidate
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.2
)]
pub struct EmpiricalDemoteThreshold(f64);

impl EmpiricalDemoteThreshold {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Observation count before empirical evidence is trusted
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct EmpiricalMinSamples(u64);

impl EmpiricalMinSamples {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Entry cap on the empirical table; least-recently-updated entries evict
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct EmpiricalMaxEntries(usize);

impl EmpiricalMaxEntries {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Classifier complexity score in the closed unit interval
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.0
)]
pub struct ComplexityScore(f64);

impl ComplexityScore {
    /// Clamps an unbounded score into the unit interval
    #[must_use]
    pub fn clamped(raw: f64) -> Self {
        // NaN falls back to zero rather than panicking.
        Self::try_new(raw.clamp(0.0, 1.0)).unwrap_or_default()
    }

    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}
