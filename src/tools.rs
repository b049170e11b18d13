//! The tool surface
//!
//! The core is invoked through named tools. Each tool is a variant of one
//! sum type with a typed parameter struct and a per-variant handler; there
//! is no runtime method lookup. Transport (MCP framing, JSON-RPC) is the
//! caller's concern.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::{ComplexityBucket, DiagnosisReport, FileError, FileUnit, Language, ProjectContext};
use crate::error::ErrorKind;
use crate::request::{RouteRequest, TaskHint};
use crate::service::{QueryMetadata, RouterService, StatusReport};

/// Parameters of the `query` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    /// The prompt
    pub prompt: String,
    /// Optional additional context
    #[serde(default)]
    pub context: Option<String>,
    /// Optional task hint
    #[serde(default)]
    pub task_hint: Option<TaskHint>,
    /// Optional explicit endpoint
    #[serde(default)]
    pub force_endpoint: Option<String>,
    /// Optional response-token override
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// `paths` accepts a single string or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathsInput {
    /// One path
    One(String),
    /// Several paths
    Many(Vec<String>),
}

impl PathsInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(path) => vec![path],
            Self::Many(paths) => paths,
        }
    }
}

/// Parameters of the `analyze_files` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFilesParams {
    /// Paths or directories to analyze
    pub paths: PathsInput,
    /// Optional glob applied to resolved file paths
    #[serde(default)]
    pub pattern: Option<String>,
    /// Optional cap on files, bounded by the configured maximum
    #[serde(default)]
    pub max_files: Option<usize>,
    /// Whether to compute the project context
    #[serde(default)]
    pub include_project_context: bool,
    /// When set, also run a query whose prompt is assembled from the files
    #[serde(default)]
    pub query: Option<String>,
}

/// Parameters of the `compare` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareParams {
    /// First path
    pub first: String,
    /// Second path
    pub second: String,
    /// When set, attach an endpoint's comparative analysis
    #[serde(default)]
    pub include_endpoint_analysis: bool,
}

/// Parameters of the `diagnose_file_access` tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnoseParams {
    /// The path to diagnose
    pub path: String,
}

/// The closed tool sum type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Route and execute a prompt
    Query(QueryParams),
    /// Analyze files, optionally attaching a query over them
    AnalyzeFiles(AnalyzeFilesParams),
    /// Report endpoint health, counters, cache, breakers, and patterns
    Status,
    /// Compare two files
    Compare(CompareParams),
    /// Run every path safety check and report each outcome
    DiagnoseFileAccess(DiagnoseParams),
}

/// A query response with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryToolOutput {
    /// The endpoint's raw response text
    pub response: String,
    /// Structured metadata
    pub metadata: QueryMetadata,
}

/// One analyzed file without its content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    /// Resolved path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Detected language
    pub language: Language,
    /// Total lines
    pub line_count: usize,
    /// Extracted imports
    pub imports: Vec<String>,
    /// Extracted functions
    pub functions: Vec<String>,
    /// Extracted classes
    pub classes: Vec<String>,
    /// Code-density bucket
    pub complexity_bucket: ComplexityBucket,
    /// How many chunks the content was split into (zero when it fits)
    pub chunk_count: usize,
}

impl From<&FileUnit> for FileSummary {
    fn from(unit: &FileUnit) -> Self {
        Self {
            path: unit.path.clone(),
            size: unit.size,
            language: unit.language,
            line_count: unit.line_count,
            imports: unit.imports.clone(),
            functions: unit.functions.clone(),
            classes: unit.classes.clone(),
            complexity_bucket: unit.complexity_bucket,
            chunk_count: unit.chunks.len(),
        }
    }
}

/// Output of `analyze_files`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFilesOutput {
    /// Per-file metadata
    pub files: Vec<FileSummary>,
    /// Per-path failures
    pub errors: Vec<FileError>,
    /// Project context, when requested
    pub project_context: Option<ProjectContext>,
    /// Attached query response, when requested
    pub query: Option<QueryToolOutput>,
}

/// Output of `compare`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareOutput {
    /// First file
    pub first: FileSummary,
    /// Second file
    pub second: FileSummary,
    /// Size difference, second minus first
    pub size_delta_bytes: i64,
    /// Line-count difference, second minus first
    pub line_delta: i64,
    /// Imports present in both
    pub shared_imports: Vec<String>,
    /// Functions present in both
    pub shared_functions: Vec<String>,
    /// Jaccard similarity over extracted symbols
    pub similarity: f64,
    /// Endpoint analysis, when requested
    pub endpoint_analysis: Option<QueryToolOutput>,
}

/// The closed tool response type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", content = "result", rename_all = "snake_case")]
pub enum ToolResponse {
    /// `query`
    Query(QueryToolOutput),
    /// `analyze_files`
    AnalyzeFiles(AnalyzeFilesOutput),
    /// `status`
    Status(StatusReport),
    /// `compare`
    Compare(CompareOutput),
    /// `diagnose_file_access`
    DiagnoseFileAccess(DiagnosisReport),
}

/// The user-visible failure shape every tool returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Error kind from the closed taxonomy
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Endpoints attempted, in order
    pub endpoints_attempted: Vec<String>,
    /// Learner-derived suggestion, when evidence exists
    pub routing_hint: Option<String>,
}

/// Dispatches one tool request to its handler
///
/// # Errors
/// A [`ToolFailure`] carrying the error kind, message, endpoints attempted,
/// and an optional routing hint.
pub async fn handle(
    service: &RouterService,
    request: ToolRequest,
) -> Result<ToolResponse, ToolFailure> {
    match request {
        ToolRequest::Query(params) => handle_query(service, params).await.map(ToolResponse::Query),
        ToolRequest::AnalyzeFiles(params) => handle_analyze_files(service, params)
            .await
            .map(ToolResponse::AnalyzeFiles),
        ToolRequest::Status => Ok(ToolResponse::Status(service.status())),
        ToolRequest::Compare(params) => handle_compare(service, params)
            .await
            .map(ToolResponse::Compare),
        ToolRequest::DiagnoseFileAccess(params) => Ok(ToolResponse::DiagnoseFileAccess(
            service.path_policy().diagnose(&params.path),
        )),
    }
}

async fn handle_query(
    service: &RouterService,
    params: QueryParams,
) -> Result<QueryToolOutput, ToolFailure> {
    let force_endpoint = match params.force_endpoint {
        Some(name) => Some(
            crate::domain_types::EndpointName::try_new(name.clone()).map_err(|_| ToolFailure {
                kind: ErrorKind::InvalidRequest,
                message: format!("'{name}' is not a valid endpoint name"),
                endpoints_attempted: Vec::new(),
                routing_hint: None,
            })?,
        ),
        None => None,
    };

    let mut request = RouteRequest::new(params.prompt);
    request.context = params.context;
    request.task_hint = params.task_hint;
    request.force_endpoint = force_endpoint;
    request.max_tokens_override = params.max_tokens;

    run_query(service, request).await
}

async fn run_query(
    service: &RouterService,
    request: RouteRequest,
) -> Result<QueryToolOutput, ToolFailure> {
    match service.query(request).await {
        Ok(outcome) => Ok(QueryToolOutput {
            response: outcome.response,
            metadata: outcome.metadata,
        }),
        Err(failure) => {
            let mut attempted: Vec<String> = Vec::new();
            for attempt in &failure.attempts {
                if !attempted.contains(&attempt.endpoint) {
                    attempted.push(attempt.endpoint.clone());
                }
            }
            Err(ToolFailure {
                kind: failure.error.kind(),
                message: failure.error.to_string(),
                endpoints_attempted: attempted,
                routing_hint: failure.routing_hint,
            })
        }
    }
}

async fn handle_analyze_files(
    service: &RouterService,
    params: AnalyzeFilesParams,
) -> Result<AnalyzeFilesOutput, ToolFailure> {
    let paths = params.paths.into_vec();
    if paths.is_empty() {
        return Err(ToolFailure {
            kind: ErrorKind::InvalidRequest,
            message: "analyze_files requires at least one path".to_string(),
            endpoints_attempted: Vec::new(),
            routing_hint: None,
        });
    }

    let report = service
        .analyze_files(&paths, params.max_files, params.include_project_context)
        .await;

    let pattern = match params.pattern.as_deref() {
        Some(raw) => Some(glob::Pattern::new(raw).map_err(|error| ToolFailure {
            kind: ErrorKind::InvalidRequest,
            message: format!("bad glob pattern '{raw}': {error}"),
            endpoints_attempted: Vec::new(),
            routing_hint: None,
        })?),
        None => None,
    };

    let files: Vec<FileSummary> = report
        .files
        .iter()
        .filter(|unit| {
            pattern.as_ref().is_none_or(|pattern| {
                pattern.matches_path(&unit.path)
                    || unit
                        .path
                        .file_name()
                        .is_some_and(|name| pattern.matches(&name.to_string_lossy()))
            })
        })
        .map(FileSummary::from)
        .collect();
    debug!(files = files.len(), errors = report.errors.len(), "analyze_files complete");

    let query = match params.query {
        Some(prompt) => {
            let mut request = RouteRequest::new(prompt);
            request.file_inputs = paths;
            Some(run_query(service, request).await?)
        }
        None => None,
    };

    Ok(AnalyzeFilesOutput {
        files,
        errors: report.errors,
        project_context: report.project_context,
        query,
    })
}

async fn handle_compare(
    service: &RouterService,
    params: CompareParams,
) -> Result<CompareOutput, ToolFailure> {
    let report = service
        .analyze_files(
            &[params.first.clone(), params.second.clone()],
            Some(2),
            false,
        )
        .await;
    if report.files.len() != 2 {
        let detail = report
            .errors
            .first()
            .map_or_else(|| "both paths must be readable files".to_string(), |e| e.reason.clone());
        return Err(ToolFailure {
            kind: ErrorKind::Rejected,
            message: format!("compare needs two readable files: {detail}"),
            endpoints_attempted: Vec::new(),
            routing_hint: None,
        });
    }

    let first = &report.files[0];
    let second = &report.files[1];

    let first_symbols: BTreeSet<&String> = first
        .imports
        .iter()
        .chain(&first.functions)
        .chain(&first.classes)
        .collect();
    let second_symbols: BTreeSet<&String> = second
        .imports
        .iter()
        .chain(&second.functions)
        .chain(&second.classes)
        .collect();
    let intersection = first_symbols.intersection(&second_symbols).count();
    let union = first_symbols.union(&second_symbols).count();
    #[allow(clippy::cast_precision_loss)]
    let similarity = if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    };

    let shared_imports: Vec<String> = first
        .imports
        .iter()
        .filter(|import| second.imports.contains(import))
        .cloned()
        .collect();
    let shared_functions: Vec<String> = first
        .functions
        .iter()
        .filter(|function| second.functions.contains(function))
        .cloned()
        .collect();

    let endpoint_analysis = if params.include_endpoint_analysis {
        let mut request = RouteRequest::new(format!(
            "Compare these two files. Describe structural differences, shared \
             responsibilities, and likely divergence:\n{} and {}",
            first.path.display(),
            second.path.display()
        ));
        request.file_inputs = vec![params.first, params.second];
        Some(run_query(service, request).await?)
    } else {
        None
    };

    #[allow(clippy::cast_possible_wrap)]
    let size_delta_bytes = second.size as i64 - first.size as i64;
    #[allow(clippy::cast_possible_wrap)]
    let line_delta = second.line_count as i64 - first.line_count as i64;
    Ok(CompareOutput {
        size_delta_bytes,
        line_delta,
        first: FileSummary::from(first),
        second: FileSummary::from(second),
        shared_imports,
        shared_functions,
        similarity,
        endpoint_analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_input_accepts_string_or_list() {
        let one: PathsInput = serde_json::from_str(r#""src/main.rs""#).unwrap();
        assert_eq!(one.into_vec(), vec!["src/main.rs"]);

        let many: PathsInput = serde_json::from_str(r#"["a.rs", "b.rs"]"#).unwrap();
        assert_eq!(many.into_vec(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_tool_request_wire_shape() {
        let raw = r#"{"tool":"query","params":{"prompt":"hello"}}"#;
        let request: ToolRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(request, ToolRequest::Query(_)));

        let raw = r#"{"tool":"status"}"#;
        let request: ToolRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(request, ToolRequest::Status));

        let raw = r#"{"tool":"diagnose_file_access","params":{"path":"/workspace/x.rs"}}"#;
        let request: ToolRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(request, ToolRequest::DiagnoseFileAccess(_)));
    }
}
