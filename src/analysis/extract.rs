//! Language detection and structure extraction
//!
//! Language is decided by a closed extension table. Imports, functions, and
//! classes are pulled with best-effort bounded regexes; the goal is
//! determinism for identical input, not a real parser.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const MAX_IMPORTS: usize = 40;
const MAX_FUNCTIONS: usize = 60;
const MAX_CLASSES: usize = 40;

/// Languages the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Language {
    Rust,
    Go,
    Python,
    JavaScript,
    TypeScript,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Shell,
    Sql,
    Html,
    Css,
    Json,
    Yaml,
    Toml,
    Markdown,
    Text,
}

impl Language {
    /// Closed extension lookup
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        let language = match extension.to_ascii_lowercase().as_str() {
            "rs" => Self::Rust,
            "go" => Self::Go,
            "py" | "pyi" => Self::Python,
            "js" | "mjs" | "cjs" | "jsx" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "java" => Self::Java,
            "c" | "h" => Self::C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Self::Cpp,
            "cs" => Self::CSharp,
            "rb" => Self::Ruby,
            "php" => Self::Php,
            "sh" | "bash" | "zsh" => Self::Shell,
            "sql" => Self::Sql,
            "html" | "htm" => Self::Html,
            "css" | "scss" | "less" => Self::Css,
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            "toml" => Self::Toml,
            "md" | "markdown" => Self::Markdown,
            "txt" | "text" | "log" => Self::Text,
            _ => return None,
        };
        Some(language)
    }

    /// Canonical lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Shell => "shell",
            Self::Sql => "sql",
            Self::Html => "html",
            Self::Css => "css",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    /// Source languages rank above markup and data in prompt assembly
    #[must_use]
    pub fn is_source(self) -> bool {
        !matches!(
            self,
            Self::Html
                | Self::Css
                | Self::Json
                | Self::Yaml
                | Self::Toml
                | Self::Markdown
                | Self::Text
        )
    }

    /// Line-comment prefixes used when counting code lines
    #[must_use]
    pub fn comment_prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Rust
            | Self::Go
            | Self::JavaScript
            | Self::TypeScript
            | Self::Java
            | Self::C
            | Self::Cpp
            | Self::CSharp
            | Self::Php => &["//", "/*", "*"],
            Self::Python | Self::Ruby | Self::Shell | Self::Yaml | Self::Toml => &["#"],
            Self::Sql => &["--"],
            Self::Html | Self::Markdown => &["<!--"],
            Self::Css => &["/*", "*"],
            Self::Json | Self::Text => &[],
        }
    }
}

/// The closed set of extensions the reader accepts by default
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "pyi", "js", "mjs", "cjs", "jsx", "ts", "tsx", "java", "c", "h", "cc",
    "cpp", "cxx", "hpp", "hh", "cs", "rb", "php", "sh", "bash", "zsh", "sql", "html", "htm",
    "css", "scss", "less", "json", "yaml", "yml", "toml", "md", "markdown", "txt", "text", "log",
];

/// Code-density bucket for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityBucket {
    /// Mostly blank or comments
    Low,
    /// Mixed
    Medium,
    /// Dense code
    High,
}

/// Extracted structure of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSummary {
    /// Import targets, bounded
    pub imports: Vec<String>,
    /// Function names, bounded
    pub functions: Vec<String>,
    /// Class/struct/type names, bounded
    pub classes: Vec<String>,
    /// Total lines
    pub line_count: usize,
    /// Non-blank, non-comment lines
    pub code_line_count: usize,
    /// Bucketized code density
    pub complexity_bucket: ComplexityBucket,
}

struct LanguagePatterns {
    imports: Option<Regex>,
    functions: Option<Regex>,
    classes: Option<Regex>,
}

fn patterns_for(language: Language) -> &'static LanguagePatterns {
    static RUST: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r"(?m)^\s*(?:pub\s+)?use\s+([\w:]+)"),
        functions: compile(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)"),
        classes: compile(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+(\w+)"),
    });
    static GO: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r#"(?m)^\s*(?:import\s+)?"([\w./-]+)""#),
        functions: compile(r"(?m)^func\s+(?:\([^)]*\)\s*)?(\w+)"),
        classes: compile(r"(?m)^type\s+(\w+)\s+(?:struct|interface)"),
    });
    static PYTHON: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))"),
        functions: compile(r"(?m)^\s*(?:async\s+)?def\s+(\w+)"),
        classes: compile(r"(?m)^\s*class\s+(\w+)"),
    });
    static JS: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(
            r#"(?m)^\s*import\s+.*?from\s+['"]([^'"]+)['"]|^\s*(?:const|let|var)\s+\w+\s*=\s*require\(['"]([^'"]+)['"]\)"#,
        ),
        functions: compile(
            r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*(\w+)|^\s*(?:const|let)\s+(\w+)\s*=\s*(?:async\s*)?(?:function|\()",
        ),
        classes: compile(r"(?m)^\s*(?:export\s+)?(?:default\s+)?class\s+(\w+)"),
    });
    static JVM: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r"(?m)^\s*(?:import|using)\s+(?:static\s+)?([\w.]+)"),
        functions: compile(
            r"(?m)^\s*(?:public|private|protected|internal|static|final|override|\s)+[\w<>\[\],\s]+\s+(\w+)\s*\(",
        ),
        classes: compile(r"(?m)^\s*(?:public\s+|abstract\s+|sealed\s+)*(?:class|interface|record|enum)\s+(\w+)"),
    });
    static C_FAMILY: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r#"(?m)^\s*#include\s+[<"]([^>"]+)[>"]"#),
        functions: compile(r"(?m)^[\w\*][\w\s\*]*?\b(\w+)\s*\([^;{]*\)\s*\{"),
        classes: compile(r"(?m)^\s*(?:class|struct|typedef struct)\s+(\w+)"),
    });
    static RUBY: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r#"(?m)^\s*require(?:_relative)?\s+['"]([^'"]+)['"]"#),
        functions: compile(r"(?m)^\s*def\s+(?:self\.)?(\w+)"),
        classes: compile(r"(?m)^\s*(?:class|module)\s+(\w+)"),
    });
    static SHELL: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: compile(r"(?m)^\s*(?:source|\.)\s+(\S+)"),
        functions: compile(r"(?m)^\s*(?:function\s+)?(\w+)\s*\(\)\s*\{"),
        classes: None,
    });
    static NONE: LazyLock<LanguagePatterns> = LazyLock::new(|| LanguagePatterns {
        imports: None,
        functions: None,
        classes: None,
    });

    match language {
        Language::Rust => &RUST,
        Language::Go => &GO,
        Language::Python => &PYTHON,
        Language::JavaScript | Language::TypeScript => &JS,
        Language::Java | Language::CSharp => &JVM,
        Language::C | Language::Cpp | Language::Php => &C_FAMILY,
        Language::Ruby => &RUBY,
        Language::Shell => &SHELL,
        _ => &NONE,
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    Some(Regex::new(pattern).expect("extraction pattern must compile"))
}

/// Extracts structure from one file's content
#[must_use]
pub fn extract(language: Language, content: &str) -> StructureSummary {
    let patterns = patterns_for(language);
    let imports = collect(patterns.imports.as_ref(), content, MAX_IMPORTS);
    let functions = collect(patterns.functions.as_ref(), content, MAX_FUNCTIONS);
    let classes = collect(patterns.classes.as_ref(), content, MAX_CLASSES);

    let line_count = content.lines().count();
    let prefixes = language.comment_prefixes();
    let code_line_count = content
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !prefixes.iter().any(|prefix| trimmed.starts_with(prefix))
        })
        .count();

    StructureSummary {
        imports,
        functions,
        classes,
        line_count,
        code_line_count,
        complexity_bucket: bucketize(code_line_count, line_count),
    }
}

/// Buckets the ratio of non-blank, non-comment lines
fn bucketize(code_lines: usize, total_lines: usize) -> ComplexityBucket {
    if total_lines == 0 {
        return ComplexityBucket::Low;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = code_lines as f64 / total_lines as f64;
    if ratio < 0.4 {
        ComplexityBucket::Low
    } else if ratio < 0.75 {
        ComplexityBucket::Medium
    } else {
        ComplexityBucket::High
    }
}

fn collect(regex: Option<&Regex>, content: &str, cap: usize) -> Vec<String> {
    let Some(regex) = regex else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for captures in regex.captures_iter(content) {
        let value = captures
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string());
        if let Some(value) = value
            && !value.is_empty()
        {
            out.push(value);
        }
        if out.len() >= cap {
            break;
        }
    }
    out
}
