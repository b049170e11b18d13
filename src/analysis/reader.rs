//! Bounded-concurrency file reading
//!
//! Expands inputs (files or directories) into candidate files through the
//! path policy, then reads them in batches of at most `concurrency` with a
//! per-file timeout. Per-file failures are recorded and never abort the
//! batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::analysis::extract::{ALLOWED_EXTENSIONS, Language};
use crate::analysis::path_safety::{BLOCKED_SEGMENTS, PathPolicy};
use crate::domain_types::{FileConcurrency, MaxFileBytes, MaxFiles};

/// Maximum directory walk depth
const MAX_WALK_DEPTH: usize = 10;

/// Limits applied to one read batch
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Per-file byte cap
    pub max_file_bytes: MaxFileBytes,
    /// Cap on files per request
    pub max_files: MaxFiles,
    /// Concurrent reads
    pub concurrency: FileConcurrency,
    /// Per-file read timeout
    pub read_timeout: Duration,
    /// Extension allowlist; `None` uses the built-in set
    pub allowed_extensions: Option<HashSet<String>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: MaxFileBytes::default(),
            max_files: MaxFiles::default(),
            concurrency: FileConcurrency::default(),
            read_timeout: Duration::from_secs(5),
            allowed_extensions: None,
        }
    }
}

impl ReadOptions {
    fn extension_allowed(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let extension = extension.to_ascii_lowercase();
        match &self.allowed_extensions {
            Some(allowed) => allowed.contains(&extension),
            None => ALLOWED_EXTENSIONS.contains(&extension.as_str()),
        }
    }
}

/// A per-path failure, recorded without aborting the batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    /// The path as resolved (or as supplied when resolution failed)
    pub path: String,
    /// What went wrong
    pub reason: String,
}

/// One successfully read file, before structure extraction
#[derive(Debug, Clone)]
pub struct RawFile {
    /// Resolved absolute path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Detected language
    pub language: Language,
    /// File content, lossily decoded
    pub content: String,
}

/// Expands and reads the inputs under the policy and options
pub async fn read_files(
    policy: &PathPolicy,
    inputs: &[String],
    options: &ReadOptions,
) -> (Vec<RawFile>, Vec<FileError>) {
    let mut errors = Vec::new();
    let candidates = expand_inputs(policy, inputs, options, &mut errors);

    let semaphore = Arc::new(Semaphore::new(options.concurrency.as_usize()));
    let reads = candidates.into_iter().map(|path| {
        let semaphore = Arc::clone(&semaphore);
        let timeout = options.read_timeout;
        let max_bytes = options.max_file_bytes.as_u64();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            read_one(path, max_bytes, timeout).await
        }
    });

    let mut files = Vec::new();
    for result in futures::future::join_all(reads).await {
        match result {
            Ok(file) => files.push(file),
            Err(error) => errors.push(error),
        }
    }
    (files, errors)
}

/// Expands each input into allowed candidate files, bounded by `max_files`
fn expand_inputs(
    policy: &PathPolicy,
    inputs: &[String],
    options: &ReadOptions,
    errors: &mut Vec<FileError>,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();

    for input in inputs {
        if candidates.len() >= options.max_files.as_usize() {
            break;
        }
        let resolved = match policy.resolve(input) {
            Ok(path) => path,
            Err(error) => {
                errors.push(FileError {
                    path: input.clone(),
                    reason: error.to_string(),
                });
                continue;
            }
        };

        // The single sanctioned fallback: when the normalized form does not
        // exist, retry once with the original input verbatim.
        let target = if resolved.exists() {
            resolved
        } else {
            let original = PathBuf::from(input);
            if original.exists() && policy.resolve(&original.display().to_string()).is_ok() {
                original
            } else {
                errors.push(FileError {
                    path: resolved.display().to_string(),
                    reason: "path does not exist".to_string(),
                });
                continue;
            }
        };

        if target.is_dir() {
            collect_from_directory(&target, options, &mut candidates, &mut seen);
        } else if options.extension_allowed(&target) {
            if seen.insert(target.clone()) {
                candidates.push(target);
            }
        } else {
            errors.push(FileError {
                path: target.display().to_string(),
                reason: "extension not allowed".to_string(),
            });
        }
    }

    candidates.truncate(options.max_files.as_usize());
    candidates
}

fn collect_from_directory(
    directory: &Path,
    options: &ReadOptions,
    candidates: &mut Vec<PathBuf>,
    seen: &mut HashSet<PathBuf>,
) {
    let walker = WalkDir::new(directory)
        .max_depth(MAX_WALK_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && BLOCKED_SEGMENTS.iter().any(|blocked| *blocked == name))
        });

    for entry in walker.flatten() {
        if candidates.len() >= options.max_files.as_usize() {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if options.extension_allowed(&path) && seen.insert(path.clone()) {
            trace!(path = %path.display(), "directory walk accepted file");
            candidates.push(path);
        }
    }
}

async fn read_one(path: PathBuf, max_bytes: u64, timeout: Duration) -> Result<RawFile, FileError> {
    let path_display = path.display().to_string();
    let metadata = tokio::fs::metadata(&path).await.map_err(|error| FileError {
        path: path_display.clone(),
        reason: format!("stat failed: {error}"),
    })?;
    if metadata.len() > max_bytes {
        return Err(FileError {
            path: path_display,
            reason: format!("file is {} bytes, cap is {max_bytes}", metadata.len()),
        });
    }

    let language = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Language::from_extension)
        .unwrap_or(Language::Text);

    let bytes = tokio::time::timeout(timeout, tokio::fs::read(&path))
        .await
        .map_err(|_| FileError {
            path: path_display.clone(),
            reason: format!("read timed out after {}ms", timeout.as_millis()),
        })?
        .map_err(|error| FileError {
            path: path_display.clone(),
            reason: format!("read failed: {error}"),
        })?;

    debug!(path = %path_display, bytes = bytes.len(), "file read");
    Ok(RawFile {
        path,
        size: metadata.len(),
        language,
        content: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn policy_for(dir: &Path) -> PathPolicy {
        PathPolicy::new(dir.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_reads_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.rs", "fn main() {}\n");
        let policy = policy_for(dir.path());

        let input = dir.path().join("main.rs").display().to_string();
        let (files, errors) = read_files(&policy, &[input], &ReadOptions::default()).await;
        assert_eq!(files.len(), 1);
        assert!(errors.is_empty());
        assert_eq!(files[0].language, Language::Rust);
        assert_eq!(files[0].content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn test_directory_walk_skips_blocked_and_disallowed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "pub fn a() {}\n");
        write(dir.path(), "src/data.bin", "binary");
        write(dir.path(), "node_modules/pkg/index.js", "module.exports = {};\n");
        let policy = policy_for(dir.path());

        let input = dir.path().display().to_string();
        let (files, _errors) = read_files(&policy, &[input], &ReadOptions::default()).await;
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"lib.rs".to_string()));
        assert!(!names.iter().any(|n| n == "index.js"));
        assert!(!names.iter().any(|n| n == "data.bin"));
    }

    #[tokio::test]
    async fn test_oversize_file_is_an_error_not_an_abort() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.txt", &"x".repeat(8192));
        write(dir.path(), "ok.txt", "fine");
        let policy = policy_for(dir.path());

        let options = ReadOptions {
            max_file_bytes: MaxFileBytes::try_new(4096).unwrap(),
            ..Default::default()
        };
        let inputs = vec![
            dir.path().join("big.txt").display().to_string(),
            dir.path().join("ok.txt").display().to_string(),
        ];
        let (files, errors) = read_files(&policy, &inputs, &options).await;
        assert_eq!(files.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("cap"));
    }

    #[tokio::test]
    async fn test_missing_path_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let input = dir.path().join("absent.rs").display().to_string();
        let (files, errors) = read_files(&policy, &[input], &ReadOptions::default()).await;
        assert!(files.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_rejected_path_is_recorded_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let (files, errors) =
            read_files(&policy, &["/etc/passwd".to_string()], &ReadOptions::default()).await;
        assert!(files.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("rejected"));
    }

    #[tokio::test]
    async fn test_max_files_bounds_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write(dir.path(), &format!("f{i}.rs"), "fn x() {}\n");
        }
        let policy = policy_for(dir.path());
        let options = ReadOptions {
            max_files: MaxFiles::try_new(3).unwrap(),
            ..Default::default()
        };
        let input = dir.path().display().to_string();
        let (files, _) = read_files(&policy, &[input], &options).await;
        assert_eq!(files.len(), 3);
    }
}
