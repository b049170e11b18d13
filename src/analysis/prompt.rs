//! Prompt assembly
//!
//! Builds the outbound prompt for one endpoint within its token budget.
//! Files go in priority order; when the budget runs out the assembler
//! either truncates through the chunker or stops with a sentinel naming how
//! much was omitted. Pre-chunked files contribute only their top chunk.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::analysis::chunker::{self, ChunkerLimits, estimate_tokens};
use crate::analysis::FileUnit;
use crate::routing::endpoint::EndpointDescriptor;

/// Tokens held back from the context window for framing overhead
pub const SAFETY_MARGIN_TOKENS: usize = 512;

/// Smallest remaining budget worth a truncated inclusion
const MIN_TRUNCATION_TOKENS: usize = 256;

/// An assembled outbound prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledPrompt {
    /// The prompt text
    pub text: String,
    /// Advisory response-token cap for the call
    pub advisory_max_tokens: u32,
    /// Files fully or partially included
    pub files_included: usize,
    /// Files omitted for budget
    pub files_omitted: usize,
    /// Chunks beyond the first, withheld from pre-chunked files
    pub chunks_omitted: usize,
}

/// Assembles the prompt for `endpoint` from the request text and files
#[must_use]
pub fn assemble(
    request_text: &str,
    endpoint: &EndpointDescriptor,
    files: &[FileUnit],
) -> AssembledPrompt {
    let context = endpoint.max_context_tokens.as_u32() as usize;
    let response = endpoint.max_response_tokens.as_u32() as usize;
    let budget = context
        .saturating_sub(response)
        .saturating_sub(SAFETY_MARGIN_TOKENS);

    let mut text = String::from(request_text);
    let mut remaining = budget.saturating_sub(estimate_tokens(request_text));
    let mut files_included = 0usize;
    let mut files_omitted = 0usize;
    let mut chunks_omitted = 0usize;

    let mut ordered: Vec<&FileUnit> = files.iter().collect();
    ordered.sort_by_key(|file| priority_key(file));

    for (index, file) in ordered.iter().enumerate() {
        let (body, withheld) = file_body(file);
        chunks_omitted += withheld;
        let header = format!(
            "\n\n// File: {} ({})\n",
            file.path.display(),
            file.language.as_str()
        );
        let section_tokens = estimate_tokens(&header) + estimate_tokens(body);

        if section_tokens <= remaining {
            text.push_str(&header);
            text.push_str(body);
            if withheld > 0 {
                text.push_str(&format!(
                    "\n[{} additional chunks of {} omitted]\n",
                    withheld,
                    file.path.display()
                ));
            }
            remaining -= section_tokens.min(remaining);
            files_included += 1;
            continue;
        }

        // Over budget: truncate through the chunker when there is room for
        // a useful slice, otherwise stop and count the rest as omitted.
        if remaining > MIN_TRUNCATION_TOKENS + estimate_tokens(&header) {
            let slice_budget = remaining - estimate_tokens(&header);
            let limits = ChunkerLimits {
                target_tokens: slice_budget.saturating_sub(16).max(1),
                max_tokens: slice_budget,
                min_tokens: 1,
                overlap_tokens: 0,
            };
            let slices = chunker::chunk(&file.path, body, file.language, &limits);
            if let Some(first) = slices.first() {
                text.push_str(&header);
                text.push_str(&first.text);
                text.push_str(&format!(
                    "\n[{} truncated to fit the context budget]\n",
                    file.path.display()
                ));
                remaining = 0;
                files_included += 1;
                files_omitted += ordered.len() - index - 1;
                break;
            }
        }

        files_omitted += ordered.len() - index;
        break;
    }

    if files_omitted > 0 {
        text.push_str(&format!(
            "\n[{files_omitted} file(s) omitted due to the context budget]\n"
        ));
    }

    trace!(
        files_included,
        files_omitted,
        chunks_omitted,
        "prompt assembled"
    );
    AssembledPrompt {
        text,
        advisory_max_tokens: endpoint.max_response_tokens.as_u32(),
        files_included,
        files_omitted,
        chunks_omitted,
    }
}

/// The body to send for a file: its top chunk when pre-chunked, the full
/// content otherwise; also how many chunks were withheld
fn file_body(file: &FileUnit) -> (&str, usize) {
    match file.chunks.first() {
        Some(first) if file.chunks.len() > 1 => (first.text.as_str(), file.chunks.len() - 1),
        Some(first) => (first.text.as_str(), 0),
        None => (file.content.as_str(), 0),
    }
}

/// Sort key: denser files first, source over markup, moderate sizes
/// (1 KiB to 50 KiB) over extremes
fn priority_key(file: &FileUnit) -> (std::cmp::Reverse<u8>, bool, u8) {
    let bucket = match file.complexity_bucket {
        crate::analysis::ComplexityBucket::High => 2,
        crate::analysis::ComplexityBucket::Medium => 1,
        crate::analysis::ComplexityBucket::Low => 0,
    };
    let markup = !file.language.is_source();
    let size_penalty = u8::from(!(1024..=51_200).contains(&file.size));
    (std::cmp::Reverse(bucket), markup, size_penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ComplexityBucket;
    use crate::domain_types::{
        ContextTokens, EndpointName, ModelId, PriorityRank, ResponseTokens,
    };
    use crate::routing::endpoint::{AuthPolicy, EndpointClass};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn endpoint(context: u32, response: u32) -> EndpointDescriptor {
        EndpointDescriptor {
            name: EndpointName::try_new("local".to_string()).unwrap(),
            base_url: "http://local.test".to_string(),
            model: ModelId::try_new("m".to_string()).unwrap(),
            class: EndpointClass::Local,
            max_context_tokens: ContextTokens::try_new(context).unwrap(),
            max_response_tokens: ResponseTokens::try_new(response).unwrap(),
            priority: PriorityRank::default(),
            auth: AuthPolicy::None,
            capabilities: BTreeSet::new(),
            health_url: None,
        }
    }

    fn unit(name: &str, content: &str, bucket: ComplexityBucket) -> FileUnit {
        FileUnit {
            path: PathBuf::from(format!("/workspace/{name}")),
            size: content.len() as u64,
            language: Language::Rust,
            line_count: content.lines().count(),
            imports: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            complexity_bucket: bucket,
            content: content.to_string(),
            chunks: Vec::new(),
        }
    }

    use crate::analysis::Language;

    #[test]
    fn test_everything_fits_in_order_of_priority() {
        let endpoint = endpoint(32_768, 4096);
        let low = unit("low.rs", "// mostly comments\n", ComplexityBucket::Low);
        let high = unit("high.rs", "fn dense() {}\n", ComplexityBucket::High);

        let assembled = assemble("prompt", &endpoint, &[low, high]);
        assert_eq!(assembled.files_included, 2);
        assert_eq!(assembled.files_omitted, 0);
        // The dense file is appended before the sparse one.
        let high_at = assembled.text.find("high.rs").unwrap();
        let low_at = assembled.text.find("low.rs").unwrap();
        assert!(high_at < low_at);
    }

    #[test]
    fn test_budget_overflow_emits_sentinel() {
        // Budget: 2048 - 1024 - 512 = 512 tokens = ~2 KiB of content.
        let endpoint = endpoint(2048, 1024);
        let first = unit("a.rs", &"fn a() {}\n".repeat(80), ComplexityBucket::High);
        let second = unit("b.rs", &"fn b() {}\n".repeat(400), ComplexityBucket::Medium);
        let third = unit("c.rs", &"fn c() {}\n".repeat(400), ComplexityBucket::Low);

        let assembled = assemble("prompt", &endpoint, &[first, second, third]);
        assert!(assembled.files_included >= 1);
        assert!(assembled.files_omitted >= 1);
        assert!(assembled.text.contains("omitted due to the context budget"));
    }

    #[test]
    fn test_prechunked_file_sends_only_top_chunk() {
        let endpoint = endpoint(32_768, 4096);
        let mut file = unit("big.js", "unused full content", ComplexityBucket::High);
        file.chunks = vec![
            Chunk {
                source_path: file.path.clone(),
                order_index: 0,
                token_estimate: 3,
                text: "chunk-zero".to_string(),
                cut_at_boundary: true,
                carry_over_tokens: 0,
            },
            Chunk {
                source_path: file.path.clone(),
                order_index: 1,
                token_estimate: 3,
                text: "chunk-one".to_string(),
                cut_at_boundary: false,
                carry_over_tokens: 1,
            },
        ];

        let assembled = assemble("prompt", &endpoint, &[file]);
        assert!(assembled.text.contains("chunk-zero"));
        assert!(!assembled.text.contains("chunk-one"));
        assert_eq!(assembled.chunks_omitted, 1);
        assert!(assembled.text.contains("additional chunks"));
    }

    use crate::analysis::Chunk;

    #[test]
    fn test_advisory_tokens_is_endpoint_response_cap() {
        let endpoint = endpoint(32_768, 2048);
        let assembled = assemble("prompt", &endpoint, &[]);
        assert_eq!(assembled.advisory_max_tokens, 2048);
    }
}
