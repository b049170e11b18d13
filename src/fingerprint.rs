//! Request fingerprinting
//!
//! Reduces a request to a stable, canonical summary used as the cache key
//! and the empirical-learner key. Pure and deterministic: the hash is
//! derived only from the fields of the fingerprint itself, over
//! whitespace-normalized text, so equivalent prompts collapse to the same
//! key.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classify;
use crate::domain_types::ComplexityScore;
use crate::request::RouteRequest;

/// Problem domain of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Data wrangling, ETL, queries
    DataProcessing,
    /// UI, markup, styling
    Frontend,
    /// Servers, APIs, storage
    Backend,
    /// Failure diagnosis
    Debugging,
    /// System-level design
    Architecture,
    /// Working over supplied files
    FileAnalysis,
    /// Everything else
    General,
}

impl Domain {
    /// Canonical lowercase name used in the hash material
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataProcessing => "data_processing",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Debugging => "debugging",
            Self::Architecture => "architecture",
            Self::FileAnalysis => "file_analysis",
            Self::General => "general",
        }
    }
}

/// Shape of the question being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// "how do I ..."
    HowTo,
    /// "what is ...", "why ..."
    Explanation,
    /// Something is broken
    Troubleshooting,
    /// "implement ...", "build ..."
    Implementation,
    /// "analyze ...", "compare ..."
    Analysis,
    /// No recognizable shape
    GeneralQuery,
}

impl QuestionType {
    /// Canonical lowercase name used in the hash material
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HowTo => "how_to",
            Self::Explanation => "explanation",
            Self::Troubleshooting => "troubleshooting",
            Self::Implementation => "implementation",
            Self::Analysis => "analysis",
            Self::GeneralQuery => "general_query",
        }
    }
}

/// Coarse prompt-size bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthBucket {
    /// Under 400 normalized characters
    Small,
    /// Under 2000 normalized characters
    Medium,
    /// Everything larger
    Large,
}

impl LengthBucket {
    fn of(len: usize) -> Self {
        if len < 400 {
            Self::Small
        } else if len < 2000 {
            Self::Medium
        } else {
            Self::Large
        }
    }

    /// Canonical lowercase name used in the hash material
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Canonical summary of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Problem domain
    pub domain: Domain,
    /// Question shape
    pub question_type: QuestionType,
    /// Sorted canonical semantic tags that matched
    pub keywords: Vec<String>,
    /// Complexity estimate in [0,1]
    pub complexity: ComplexityScore,
    /// Prompt-size bucket
    pub length_bucket: LengthBucket,
    /// Whether the text carries code
    pub has_code: bool,
    /// Whether the text carries JSON
    pub has_json: bool,
    /// SHA-256 over the canonical field string; 64 hex chars
    pub hash: String,
}

/// Fixed domain keyword table; tags are the canonical keyword strings
const DOMAIN_KEYWORDS: &[(Domain, &[&str])] = &[
    (
        Domain::DataProcessing,
        &[
            "csv", "dataframe", "pandas", "etl", "sql", "dataset", "aggregate",
            "parse", "transform", "pipeline",
        ],
    ),
    (
        Domain::Frontend,
        &[
            "react", "css", "html", "component", "dom", "layout", "browser",
            "frontend", "ui",
        ],
    ),
    (
        Domain::Backend,
        &[
            "api", "server", "endpoint", "database", "http", "auth", "backend",
            "middleware", "queue",
        ],
    ),
    (
        Domain::Debugging,
        &[
            "error", "bug", "crash", "stack trace", "panic", "exception",
            "segfault", "not working", "fails",
        ],
    ),
    (
        Domain::Architecture,
        &[
            "architecture", "design pattern", "microservice", "scalability",
            "system design", "modular", "decouple",
        ],
    ),
    (
        Domain::FileAnalysis,
        &[
            "analyze file", "this file", "codebase", "repository", "refactor",
            "review the code", "these files",
        ],
    ),
];

/// Fixed question-type table; first match wins
const QUESTION_PATTERNS: &[(QuestionType, &str)] = &[
    (QuestionType::HowTo, r"(?i)\bhow (do|can|to|would|should) \w+"),
    (
        QuestionType::Troubleshooting,
        r"(?i)\b(error|broken|not working|fails|failing|crash|fix)\b",
    ),
    (
        QuestionType::Implementation,
        r"(?i)\b(implement|write|create|build|add|generate)\b",
    ),
    (
        QuestionType::Analysis,
        r"(?i)\b(analy[sz]e|review|compare|evaluate|assess|audit)\b",
    ),
    (
        QuestionType::Explanation,
        r"(?i)\b(what (is|are|does)|why|explain|difference between)\b",
    ),
];

static QUESTION_REGEXES: LazyLock<Vec<(QuestionType, Regex)>> = LazyLock::new(|| {
    QUESTION_PATTERNS
        .iter()
        .map(|(qt, pattern)| (*qt, Regex::new(pattern).expect("question pattern must compile")))
        .collect()
});

static CODE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|\bfn \w+\(|\bdef \w+\(|\bclass \w+|=>|;\s*$|\{\s*\}").expect("code regex")
});

static JSON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\{\[]\s*""#).expect("json regex"));

/// Fingerprints a request from its combined text
#[must_use]
pub fn fingerprint(request: &RouteRequest) -> Fingerprint {
    let raw = request.combined_text();
    fingerprint_text(&raw, !request.file_inputs.is_empty())
}

/// Fingerprints bare text; `has_files` biases the domain toward file analysis
#[must_use]
pub fn fingerprint_text(raw: &str, has_files: bool) -> Fingerprint {
    let normalized = classify::normalize(raw);

    let mut keywords: Vec<String> = Vec::new();
    let mut best_domain = Domain::General;
    let mut best_count = 0usize;
    for (domain, domain_keywords) in DOMAIN_KEYWORDS {
        let mut count = 0usize;
        for keyword in *domain_keywords {
            if normalized.contains(keyword) {
                count += 1;
                keywords.push((*keyword).to_string());
            }
        }
        if count > best_count {
            best_count = count;
            best_domain = *domain;
        }
    }
    if has_files && best_count == 0 {
        best_domain = Domain::FileAnalysis;
    }
    keywords.sort();
    keywords.dedup();
    keywords.truncate(12);

    let question_type = QUESTION_REGEXES
        .iter()
        .find(|(_, regex)| regex.is_match(&normalized))
        .map_or(QuestionType::GeneralQuery, |(qt, _)| *qt);

    #[allow(clippy::cast_precision_loss)]
    let length_factor = (normalized.len() as f64 / 4000.0).min(0.3);
    let complexity = ComplexityScore::clamped(
        classify::indicator_score(&normalized) + length_factor,
    );

    let length_bucket = LengthBucket::of(normalized.len());
    let has_code = CODE_REGEX.is_match(raw);
    let has_json = JSON_REGEX.is_match(raw);

    let hash = canonical_hash(
        best_domain,
        question_type,
        &keywords,
        complexity,
        length_bucket,
        has_code,
        has_json,
    );

    Fingerprint {
        domain: best_domain,
        question_type,
        keywords,
        complexity,
        length_bucket,
        has_code,
        has_json,
        hash,
    }
}

fn canonical_hash(
    domain: Domain,
    question_type: QuestionType,
    keywords: &[String],
    complexity: ComplexityScore,
    length_bucket: LengthBucket,
    has_code: bool,
    has_json: bool,
) -> String {
    // Complexity is quantized to two decimals so float noise cannot split
    // otherwise-identical fingerprints.
    let material = format!(
        "{}|{}|{}|{:.2}|{}|{}|{}",
        domain.as_str(),
        question_type.as_str(),
        keywords.join(","),
        complexity.as_f64(),
        length_bucket.as_str(),
        u8::from(has_code),
        u8::from(has_json),
    );
    let digest = Sha256::digest(material.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
