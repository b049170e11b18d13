//! File analysis pipeline
//!
//! Safe path resolution, bounded concurrent reads, structure extraction,
//! semantic chunking of oversized content, and prompt assembly. The
//! pipeline realizes files eagerly (the set is bounded by `max_files`) but
//! chunks lazily consumable: prompt assembly may take only the first chunk.

pub mod chunker;
pub mod extract;
pub mod path_safety;
pub mod prompt;
pub mod reader;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use chunker::{Chunk, ChunkerLimits, estimate_tokens};
pub use extract::{ComplexityBucket, Language, StructureSummary};
pub use path_safety::{DiagnosisReport, PathPolicy, SafetyCheck};
pub use prompt::{AssembledPrompt, assemble};
pub use reader::{FileError, ReadOptions, read_files};

/// One analyzed source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUnit {
    /// Resolved absolute path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Detected language
    pub language: Language,
    /// Total lines
    pub line_count: usize,
    /// Extracted import targets, bounded
    pub imports: Vec<String>,
    /// Extracted function names, bounded
    pub functions: Vec<String>,
    /// Extracted class names, bounded
    pub classes: Vec<String>,
    /// Code-density bucket
    pub complexity_bucket: ComplexityBucket,
    /// Full content
    pub content: String,
    /// Chunks, present only when the content exceeded the chunk cap
    pub chunks: Vec<Chunk>,
}

/// Options for [`analyze`]
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Read-stage limits
    pub read: ReadOptions,
    /// Chunking budgets for oversized content
    pub chunker: ChunkerLimits,
    /// Whether to compute the cross-file project context
    pub include_project_context: bool,
}

/// Project-level union over the analyzed files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Languages present
    pub languages: BTreeSet<String>,
    /// Directories containing analyzed files
    pub directories: BTreeSet<String>,
    /// File counts per extension
    pub file_type_counts: BTreeMap<String, usize>,
    /// First segments of import paths
    pub import_roots: BTreeSet<String>,
    /// Framework tags recognized from imports
    pub frameworks: BTreeSet<String>,
}

/// Result of one analysis run; partial success is normal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Successfully analyzed files
    pub files: Vec<FileUnit>,
    /// Per-path failures
    pub errors: Vec<FileError>,
    /// Cross-file context, when requested and at least two files succeeded
    pub project_context: Option<ProjectContext>,
}

/// Closed framework keyword table applied to import targets
const FRAMEWORK_KEYWORDS: &[(&str, &str)] = &[
    ("react", "react"),
    ("vue", "vue"),
    ("angular", "angular"),
    ("next", "nextjs"),
    ("express", "express"),
    ("django", "django"),
    ("flask", "flask"),
    ("rails", "rails"),
    ("spring", "spring"),
    ("tokio", "tokio"),
    ("actix", "actix"),
    ("axum", "axum"),
    ("numpy", "numpy"),
    ("pandas", "pandas"),
];

/// Runs the full pipeline over the inputs
pub async fn analyze(
    policy: &PathPolicy,
    inputs: &[String],
    options: &AnalysisOptions,
) -> AnalysisReport {
    let (raw_files, errors) = read_files(policy, inputs, &options.read).await;

    let mut files = Vec::with_capacity(raw_files.len());
    for raw in raw_files {
        let summary = extract::extract(raw.language, &raw.content);
        let chunks = if estimate_tokens(&raw.content) > options.chunker.max_tokens {
            chunker::chunk(&raw.path, &raw.content, raw.language, &options.chunker)
        } else {
            Vec::new()
        };
        files.push(FileUnit {
            path: raw.path,
            size: raw.size,
            language: raw.language,
            line_count: summary.line_count,
            imports: summary.imports,
            functions: summary.functions,
            classes: summary.classes,
            complexity_bucket: summary.complexity_bucket,
            content: raw.content,
            chunks,
        });
    }

    let project_context = if options.include_project_context && files.len() >= 2 {
        Some(project_context(&files))
    } else {
        None
    };

    debug!(
        files = files.len(),
        errors = errors.len(),
        "analysis complete"
    );
    AnalysisReport {
        files,
        errors,
        project_context,
    }
}

fn project_context(files: &[FileUnit]) -> ProjectContext {
    let mut languages = BTreeSet::new();
    let mut directories = BTreeSet::new();
    let mut file_type_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut import_roots = BTreeSet::new();
    let mut frameworks = BTreeSet::new();

    for file in files {
        languages.insert(file.language.as_str().to_string());
        if let Some(parent) = file.path.parent() {
            directories.insert(parent.display().to_string());
        }
        if let Some(extension) = file.path.extension().and_then(|e| e.to_str()) {
            *file_type_counts
                .entry(extension.to_ascii_lowercase())
                .or_insert(0) += 1;
        }
        for import in &file.imports {
            let root = import
                .split(['.', '/', ':'])
                .find(|segment| !segment.is_empty())
                .unwrap_or(import)
                .to_string();
            let lowered = root.to_lowercase();
            for (keyword, tag) in FRAMEWORK_KEYWORDS {
                if lowered.contains(keyword) {
                    frameworks.insert((*tag).to_string());
                }
            }
            import_roots.insert(root);
        }
    }

    ProjectContext {
        languages,
        directories,
        file_type_counts,
        import_roots,
        frameworks,
    }
}
