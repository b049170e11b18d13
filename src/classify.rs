//! Request complexity classification
//!
//! Scores a request in [0,1] and labels its intent from two closed pattern
//! sets plus a closed set of complexity-indicator categories. The output is
//! advisory: it scales timeouts and token budgets but never forbids an
//! endpoint.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain_types::ComplexityScore;

/// Classified intent of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Small, self-contained ask
    Simple,
    /// Multi-part or system-level ask
    Complex,
    /// Neither signal is decisive
    Ambiguous,
}

/// Classifier output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Complexity score in [0,1]
    pub score: ComplexityScore,
    /// Intent label
    pub intent: Intent,
    /// Labels of every matched pattern, for diagnostics
    pub matched_patterns: Vec<String>,
    /// One-line explanation of the decision
    pub reason: String,
}

struct WeightedPattern {
    label: &'static str,
    weight: f64,
    pattern: &'static str,
}

const SIMPLE_PATTERNS: &[WeightedPattern] = &[
    WeightedPattern {
        label: "simple:write-small-unit",
        weight: 0.8,
        pattern: r"(?i)\bwrite (a|me a) (function|method|script|regex|query|one-liner)\b",
    },
    WeightedPattern {
        label: "simple:what-is",
        weight: 0.9,
        pattern: r"(?i)^\s*what (is|are|does)\b",
    },
    WeightedPattern {
        label: "simple:syntax",
        weight: 0.8,
        pattern: r"(?i)\bsyntax (for|of)\b",
    },
    WeightedPattern {
        label: "simple:example",
        weight: 0.6,
        pattern: r"(?i)\b(show|give) (me )?an example\b",
    },
    WeightedPattern {
        label: "simple:quick",
        weight: 0.5,
        pattern: r"(?i)\b(quick|simple|small|trivial) (question|fix|change|snippet)\b",
    },
    WeightedPattern {
        label: "simple:convert",
        weight: 0.6,
        pattern: r"(?i)\bconvert (this|a|the) \w+ (to|into)\b",
    },
];

const COMPLEX_PATTERNS: &[WeightedPattern] = &[
    WeightedPattern {
        label: "complex:architecture",
        weight: 0.9,
        pattern: r"(?i)\b(architect(ure)?|system design|redesign)\b",
    },
    WeightedPattern {
        label: "complex:distributed",
        weight: 0.9,
        pattern: r"(?i)\b(distributed|microservices?|scalab\w+|sharding)\b",
    },
    WeightedPattern {
        label: "complex:migration",
        weight: 0.7,
        pattern: r"(?i)\bmigrat(e|ion|ing)\b",
    },
    WeightedPattern {
        label: "complex:refactor-codebase",
        weight: 0.8,
        pattern: r"(?i)\brefactor\w* (the|this|our|an?) (entire |whole |large )?(codebase|project|repo|module|service)\b",
    },
    WeightedPattern {
        label: "complex:end-to-end",
        weight: 0.7,
        pattern: r"(?i)\bend.to.end\b",
    },
    WeightedPattern {
        label: "complex:design-a",
        weight: 0.7,
        pattern: r"(?i)\bdesign an? \w+",
    },
    WeightedPattern {
        label: "complex:multi-step",
        weight: 0.6,
        pattern: r"(?i)\b(multi[- ]?step|several (stages|phases)|across (multiple|several))\b",
    },
];

struct IndicatorCategory {
    name: &'static str,
    weight: f64,
    keywords: &'static [&'static str],
}

const INDICATOR_CATEGORIES: &[IndicatorCategory] = &[
    IndicatorCategory {
        name: "architectural",
        weight: 0.15,
        keywords: &[
            "architecture",
            "system design",
            "module boundaries",
            "separation of concerns",
            "event-driven",
            "layered",
        ],
    },
    IndicatorCategory {
        name: "coordination",
        weight: 0.10,
        keywords: &[
            "orchestrate",
            "orchestration",
            "pipeline",
            "workflow",
            "concurrency",
            "synchronization",
            "scheduling",
        ],
    },
    IndicatorCategory {
        name: "enterprise",
        weight: 0.10,
        keywords: &[
            "compliance",
            "audit",
            "multi-tenant",
            "sla",
            "governance",
            "high availability",
        ],
    },
    IndicatorCategory {
        name: "integration",
        weight: 0.10,
        keywords: &[
            "integration",
            "integrate with",
            "webhook",
            "third-party",
            "protocol",
            "interoperab",
        ],
    },
    IndicatorCategory {
        name: "planning",
        weight: 0.05,
        keywords: &["roadmap", "milestone", "phases", "estimate", "trade-off"],
    },
];

static SIMPLE_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(SIMPLE_PATTERNS));
static COMPLEX_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(COMPLEX_PATTERNS));

fn compile(patterns: &[WeightedPattern]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p.pattern).expect("classifier pattern must compile"))
        .collect()
}

/// Additive score from the indicator categories over normalized text
///
/// Shared with the fingerprinter, which folds the same signal into its
/// complexity field.
#[must_use]
pub fn indicator_score(normalized: &str) -> f64 {
    INDICATOR_CATEGORIES
        .iter()
        .filter(|category| {
            category
                .keywords
                .iter()
                .any(|keyword| normalized.contains(keyword))
        })
        .map(|category| category.weight)
        .sum()
}

/// Collapses whitespace runs, trims, and lowercases
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Classifies a request's combined text
#[must_use]
pub fn classify(text: &str) -> Classification {
    let normalized = normalize(text);
    let mut matched = Vec::new();

    let simple_confidence = strongest_match(SIMPLE_PATTERNS, &SIMPLE_REGEXES, &normalized, &mut matched);
    let complex_confidence =
        strongest_match(COMPLEX_PATTERNS, &COMPLEX_REGEXES, &normalized, &mut matched);

    let indicators = indicator_score(&normalized);
    #[allow(clippy::cast_precision_loss)]
    let length_factor = (text.len() as f64 / 1000.0).min(0.3);

    let score = ComplexityScore::clamped(complex_confidence + indicators + length_factor);

    let (intent, reason) = if complex_confidence > 0.7 {
        (Intent::Complex, format!("complex pattern confidence {complex_confidence:.2}"))
    } else if score.as_f64() >= 0.6 {
        (Intent::Complex, format!("aggregate score {:.2}", score.as_f64()))
    } else if simple_confidence > 0.7 && score.as_f64() < 0.3 {
        (Intent::Simple, format!("simple pattern confidence {simple_confidence:.2}"))
    } else {
        (Intent::Ambiguous, "no decisive signal".to_string())
    };

    Classification {
        score,
        intent,
        matched_patterns: matched,
        reason,
    }
}

fn strongest_match(
    patterns: &[WeightedPattern],
    regexes: &[Regex],
    normalized: &str,
    matched: &mut Vec<String>,
) -> f64 {
    let mut strongest: f64 = 0.0;
    for (pattern, regex) in patterns.iter().zip(regexes.iter()) {
        if regex.is_match(normalized) {
            matched.push(pattern.label.to_string());
            strongest = strongest.max(pattern.weight);
        }
    }
    strongest
}
