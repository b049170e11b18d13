//! Semantic chunking of oversized content
//!
//! Splits text into token-bounded chunks at language-aware line boundaries,
//! carrying an overlap prefix from chunk to chunk so cross-chunk references
//! stay resolvable. Token counts are the crude `ceil(bytes / 4)` estimate;
//! every budget below is expressed in those units.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::analysis::extract::Language;

/// How far, in lines, the boundary search ranges around the target cut
const BOUNDARY_SEARCH_LINES: usize = 10;

/// Estimates tokens as `ceil(bytes / 4)`
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Chunking budgets, all in estimated tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerLimits {
    /// Preferred chunk size
    pub target_tokens: usize,
    /// Hard cap per chunk, overlap included
    pub max_tokens: usize,
    /// Floor below which a terminal remainder merges backward
    pub min_tokens: usize,
    /// Overlap carried from the previous chunk
    pub overlap_tokens: usize,
}

impl Default for ChunkerLimits {
    fn default() -> Self {
        Self {
            target_tokens: 20_000,
            max_tokens: 25_000,
            min_tokens: 1_000,
            overlap_tokens: 500,
        }
    }
}

/// A bounded slice of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// File the chunk came from
    pub source_path: PathBuf,
    /// Position in the chunk sequence
    pub order_index: usize,
    /// Estimated tokens of `text`, overlap included
    pub token_estimate: usize,
    /// The chunk text (overlap prefix plus content)
    pub text: String,
    /// Whether the trailing cut landed on a semantic boundary
    pub cut_at_boundary: bool,
    /// Estimated tokens of the overlap prefix shared with the predecessor
    pub carry_over_tokens: usize,
}

static BOUNDARY_CURLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\}|\};)\s*$|^(?:pub\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s|^impl\b|^(?:pub\s+)?(?:struct|enum|trait|mod|const|static)\s|^use\s|^#\[|^///|^//!|^func\s|^type\s|^import\b|^export\b|^(?:export\s+)?(?:default\s+)?class\s|^(?:export\s+)?(?:async\s+)?function\b|^(?:const|let|var)\s|^/\*\*|^//",
    )
    .expect("curly boundary regex")
});

static BOUNDARY_PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?def\s|^class\s|^import\s|^from\s|^#|^@\w+|^if\s+__name__")
        .expect("python boundary regex")
});

static BOUNDARY_GENERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#+\s|^---\s*$|^\[\w|^<\w+").expect("generic boundary regex"));

fn boundary_regex(language: Language) -> &'static Regex {
    match language {
        Language::Python | Language::Ruby | Language::Shell | Language::Yaml => &BOUNDARY_PYTHON,
        Language::Markdown | Language::Html | Language::Toml | Language::Text => &BOUNDARY_GENERIC,
        _ => &BOUNDARY_CURLY,
    }
}

struct Segment {
    text: String,
    tokens: usize,
    /// True when the segment begins a real input line (not a hard split)
    line_start: bool,
    blank: bool,
}

/// Chunks `text`; a single verbatim chunk when it fits under `max_tokens`
#[must_use]
pub fn chunk(
    source_path: &Path,
    text: &str,
    language: Language,
    limits: &ChunkerLimits,
) -> Vec<Chunk> {
    let total = estimate_tokens(text);
    if total <= limits.max_tokens {
        return vec![Chunk {
            source_path: source_path.to_path_buf(),
            order_index: 0,
            token_estimate: total,
            text: text.to_string(),
            cut_at_boundary: false,
            carry_over_tokens: 0,
        }];
    }

    // Content budget leaves room for the overlap prefix under the hard cap.
    let content_budget = limits
        .max_tokens
        .saturating_sub(limits.overlap_tokens)
        .max(1);
    let target = limits.target_tokens.min(content_budget);

    let segments = build_segments(text, content_budget);
    let boundary = boundary_regex(language);
    let is_boundary: Vec<bool> = segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            segment.line_start
                && !segment.blank
                && (boundary.is_match(segment.text.trim_end())
                    || (index > 0 && segments[index - 1].blank))
        })
        .collect();

    // Prefix sums for O(1) token ranges.
    let mut prefix = Vec::with_capacity(segments.len() + 1);
    prefix.push(0usize);
    for segment in &segments {
        prefix.push(prefix.last().copied().unwrap_or(0) + segment.tokens);
    }
    let range_tokens = |from: usize, to: usize| prefix[to] - prefix[from];

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut carry_text = String::new();
    let mut pos = 0usize;

    while pos < segments.len() {
        // The carry may overshoot the configured overlap by one line, so the
        // content budget for this chunk is computed against the actual carry.
        let carry_tokens = estimate_tokens(&carry_text);
        let chunk_budget = limits.max_tokens.saturating_sub(carry_tokens).max(1);
        let target = target.min(chunk_budget);

        // First index where the cumulative content crosses the target.
        let mut crossing = pos;
        while crossing < segments.len() && range_tokens(pos, crossing) < target {
            crossing += 1;
        }

        let (mut cut, mut cut_at_boundary) = (crossing, false);
        if crossing < segments.len() {
            let low = crossing.saturating_sub(BOUNDARY_SEARCH_LINES).max(pos + 1);
            let high = (crossing + BOUNDARY_SEARCH_LINES).min(segments.len() - 1);
            let mut best: Option<(usize, usize, bool)> = None;
            for candidate in low..=high {
                if !is_boundary[candidate] {
                    continue;
                }
                let tokens = range_tokens(pos, candidate);
                if tokens == 0 || tokens > chunk_budget {
                    continue;
                }
                let distance = tokens.abs_diff(target);
                let after_blank = candidate > 0 && segments[candidate - 1].blank;
                let better = match best {
                    None => true,
                    // Closer to target wins; between equals, prefer a cut
                    // that lies after a blank line.
                    Some((best_distance, _, best_after_blank)) => {
                        distance < best_distance
                            || (distance == best_distance && after_blank && !best_after_blank)
                    }
                };
                if better {
                    best = Some((distance, candidate, after_blank));
                }
            }
            if let Some((_, candidate, _)) = best {
                cut = candidate;
                cut_at_boundary = true;
            }
        }

        // Never exceed the budget regardless of where the cut fell.
        while cut > pos + 1 && range_tokens(pos, cut) > chunk_budget {
            cut -= 1;
            cut_at_boundary = false;
        }
        if cut == pos {
            cut = pos + 1;
        }

        let content: String = segments[pos..cut]
            .iter()
            .map(|segment| segment.text.as_str())
            .collect();
        let content_tokens = estimate_tokens(&content);

        // Terminal short remainder: merge backward unless that would
        // overflow the previous chunk.
        if cut == segments.len()
            && content_tokens < limits.min_tokens
            && let Some(previous) = chunks.last_mut()
            && previous.token_estimate + content_tokens <= limits.max_tokens
        {
            previous.text.push_str(&content);
            previous.token_estimate = estimate_tokens(&previous.text);
            break;
        }

        let carry_over_tokens = carry_tokens;
        let chunk_text = format!("{carry_text}{content}");
        chunks.push(Chunk {
            source_path: source_path.to_path_buf(),
            order_index: chunks.len(),
            token_estimate: estimate_tokens(&chunk_text),
            text: chunk_text,
            cut_at_boundary,
            carry_over_tokens,
        });

        carry_text = carry_tail(&segments[pos..cut], limits.overlap_tokens);
        pos = cut;
    }

    chunks
}

/// Trailing slice of the emitted content estimating to `overlap_tokens`,
/// or all of it when the content is smaller
///
/// Whole trailing lines are gathered first, then the earliest one is
/// trimmed at a char boundary so the carry never exceeds the overlap and
/// the next chunk's budget stays predictable.
fn carry_tail(segments: &[Segment], overlap_tokens: usize) -> String {
    if overlap_tokens == 0 {
        return String::new();
    }
    let mut tokens = 0usize;
    let mut start = segments.len();
    while start > 0 && tokens < overlap_tokens {
        start -= 1;
        tokens += segments[start].tokens;
    }
    let tail: String = segments[start..]
        .iter()
        .map(|segment| segment.text.as_str())
        .collect();

    let cap_bytes = overlap_tokens * 4;
    if tail.len() <= cap_bytes {
        return tail;
    }
    let mut from = tail.len() - cap_bytes;
    while !tail.is_char_boundary(from) {
        from += 1;
    }
    tail[from..].to_string()
}

/// Splits text into byte-preserving line segments; lines larger than the
/// content budget are hard-split at char boundaries
fn build_segments(text: &str, content_budget: usize) -> Vec<Segment> {
    let budget_bytes = content_budget.saturating_mul(4).max(4);
    let mut segments = Vec::new();
    for line in text.split_inclusive('\n') {
        if line.len() <= budget_bytes {
            segments.push(Segment {
                tokens: estimate_tokens(line),
                blank: line.trim().is_empty(),
                line_start: true,
                text: line.to_string(),
            });
            continue;
        }
        let mut rest = line;
        let mut first = true;
        while !rest.is_empty() {
            let mut split = budget_bytes.min(rest.len());
            while !rest.is_char_boundary(split) {
                split -= 1;
            }
            let (piece, remainder) = rest.split_at(split);
            segments.push(Segment {
                tokens: estimate_tokens(piece),
                blank: false,
                line_start: first,
                text: piece.to_string(),
            });
            first = false;
            rest = remainder;
        }
    }
    segments
}
