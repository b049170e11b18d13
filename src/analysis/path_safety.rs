//! Path normalization and safety checks
//!
//! Accepts three surface forms: native POSIX paths, Windows-style paths
//! with backslashes, and the WSL UNC form. Everything reduces to a
//! normalized absolute path inside the operator-configured workspace root
//! or is rejected. All checks are lexical; the filesystem is only consulted
//! by callers after a path has passed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// Literal UNC prefix of the WSL remote-filesystem form
const WSL_UNC_PREFIX: &str = r"\\wsl.localhost\Ubuntu";

/// Absolute prefixes that are never readable
const RESTRICTED_PREFIXES: &[&str] = &["/etc", "/proc", "/sys"];

/// Directory segments that are blocked wherever they appear
///
/// The check is segment-equal, never substring: `build` is blocked,
/// `build_scripts.go` is not.
pub const BLOCKED_SEGMENTS: &[&str] = &["node_modules", ".git", "dist", "build", "__pycache__"];

/// One safety check with its result, for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheck {
    /// Which rule ran
    pub name: String,
    /// Whether the path passed it
    pub passed: bool,
    /// Human-readable detail
    pub detail: String,
}

/// Full report produced by [`PathPolicy::diagnose`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    /// The input as supplied
    pub input: String,
    /// The normalized form, when normalization got that far
    pub normalized: Option<String>,
    /// Every check and its outcome
    pub checks: Vec<SafetyCheck>,
    /// The resolved path when every check passed
    pub resolved: Option<PathBuf>,
}

/// Workspace-rooted path policy
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace_root: PathBuf,
}

impl PathPolicy {
    /// Creates a policy rooted at `workspace_root`
    ///
    /// # Errors
    /// Returns `RouteError::Config` when the root is not absolute.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, RouteError> {
        let workspace_root = workspace_root.into();
        if !workspace_root.is_absolute() {
            return Err(RouteError::Config {
                reason: format!(
                    "workspace_root must be absolute, got '{}'",
                    workspace_root.display()
                ),
            });
        }
        Ok(Self { workspace_root })
    }

    /// The configured root
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolves an input to a normalized absolute path inside the root
    ///
    /// # Errors
    /// Returns `RouteError::Rejected` naming the failed check.
    pub fn resolve(&self, input: &str) -> Result<PathBuf, RouteError> {
        let normalized = normalize_surface_form(input);

        let joined = if normalized.starts_with('/') {
            PathBuf::from(&normalized)
        } else {
            self.workspace_root.join(&normalized)
        };

        let resolved = lexical_normalize(&joined).ok_or_else(|| RouteError::Rejected {
            path: input.to_string(),
            reason: "parent traversal escapes the filesystem root".to_string(),
        })?;

        for prefix in RESTRICTED_PREFIXES {
            if resolved.starts_with(prefix) {
                return Err(RouteError::Rejected {
                    path: input.to_string(),
                    reason: format!("restricted prefix {prefix}"),
                });
            }
        }

        let Ok(relative) = resolved.strip_prefix(&self.workspace_root) else {
            return Err(RouteError::Rejected {
                path: input.to_string(),
                reason: format!(
                    "resolves outside workspace root {}",
                    self.workspace_root.display()
                ),
            });
        };

        for component in relative.components() {
            let segment = component.as_os_str().to_string_lossy();
            if BLOCKED_SEGMENTS.iter().any(|blocked| *blocked == segment) {
                return Err(RouteError::Rejected {
                    path: input.to_string(),
                    reason: format!("blocked segment '{segment}'"),
                });
            }
        }

        Ok(resolved)
    }

    /// Runs every check independently and reports each outcome
    #[must_use]
    pub fn diagnose(&self, input: &str) -> DiagnosisReport {
        let normalized = normalize_surface_form(input);
        let mut checks = Vec::new();

        let joined = if normalized.starts_with('/') {
            PathBuf::from(&normalized)
        } else {
            self.workspace_root.join(&normalized)
        };
        let lexical = lexical_normalize(&joined);
        checks.push(SafetyCheck {
            name: "traversal".to_string(),
            passed: lexical.is_some(),
            detail: match &lexical {
                Some(path) => format!("normalizes to {}", path.display()),
                None => "parent traversal escapes the filesystem root".to_string(),
            },
        });

        let Some(resolved) = lexical else {
            return DiagnosisReport {
                input: input.to_string(),
                normalized: Some(normalized),
                checks,
                resolved: None,
            };
        };

        let restricted = RESTRICTED_PREFIXES
            .iter()
            .find(|prefix| resolved.starts_with(prefix));
        checks.push(SafetyCheck {
            name: "restricted_prefix".to_string(),
            passed: restricted.is_none(),
            detail: restricted.map_or_else(
                || "no restricted prefix".to_string(),
                |prefix| format!("under restricted prefix {prefix}"),
            ),
        });

        let inside_root = resolved.strip_prefix(&self.workspace_root).is_ok();
        checks.push(SafetyCheck {
            name: "workspace_root".to_string(),
            passed: inside_root,
            detail: if inside_root {
                format!("inside {}", self.workspace_root.display())
            } else {
                format!("outside {}", self.workspace_root.display())
            },
        });

        let blocked = resolved
            .strip_prefix(&self.workspace_root)
            .ok()
            .and_then(|relative| {
                relative.components().find_map(|component| {
                    let segment = component.as_os_str().to_string_lossy().into_owned();
                    BLOCKED_SEGMENTS
                        .iter()
                        .any(|candidate| *candidate == segment)
                        .then_some(segment)
                })
            });
        checks.push(SafetyCheck {
            name: "blocked_segment".to_string(),
            passed: blocked.is_none(),
            detail: blocked.map_or_else(
                || "no blocked segments".to_string(),
                |segment| format!("blocked segment '{segment}'"),
            ),
        });

        let exists = resolved.exists();
        checks.push(SafetyCheck {
            name: "exists".to_string(),
            passed: exists,
            detail: if exists {
                "path exists".to_string()
            } else {
                "path does not exist".to_string()
            },
        });

        let all_passed = checks
            .iter()
            .filter(|check| check.name != "exists")
            .all(|check| check.passed);
        DiagnosisReport {
            input: input.to_string(),
            normalized: Some(normalized),
            checks,
            resolved: all_passed.then_some(resolved),
        }
    }
}

/// Reduces any of the three accepted surface forms to forward slashes with
/// collapsed separators
fn normalize_surface_form(input: &str) -> String {
    let mut text = input.trim().to_string();

    if let Some(rest) = text.strip_prefix(WSL_UNC_PREFIX) {
        text = rest.to_string();
    }

    // A Windows drive prefix is dropped; the remainder is treated as
    // rooted.
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        text = text[2..].to_string();
    }

    text = text.replace('\\', "/");

    // Collapse redundant separators.
    let mut collapsed = String::with_capacity(text.len());
    let mut previous_slash = false;
    for ch in text.chars() {
        if ch == '/' {
            if !previous_slash {
                collapsed.push('/');
            }
            previous_slash = true;
        } else {
            collapsed.push(ch);
            previous_slash = false;
        }
    }
    collapsed
}

/// Resolves `.` and `..` lexically; `None` when `..` escapes the root
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    use std::path::Component;

    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(segment) => {
                out.push(segment);
                depth += 1;
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PathPolicy {
        PathPolicy::new("/workspace").unwrap()
    }

    #[test]
    fn test_posix_relative_resolves_under_root() {
        let resolved = policy().resolve("src/main.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/main.rs"));
    }

    #[test]
    fn test_windows_form_is_normalized() {
        let resolved = policy().resolve(r"C:\workspace\src\lib.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/lib.rs"));
    }

    #[test]
    fn test_wsl_unc_prefix_is_stripped() {
        let resolved = policy()
            .resolve(r"\\wsl.localhost\Ubuntu\workspace\src\lib.rs")
            .unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/lib.rs"));
    }

    #[test]
    fn test_redundant_separators_collapse() {
        let resolved = policy().resolve("/workspace//src///main.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/main.rs"));
    }

    #[test]
    fn test_traversal_escape_is_rejected() {
        let error = policy().resolve("/workspace/../etc/passwd").unwrap_err();
        assert!(matches!(error, RouteError::Rejected { .. }));
        assert!(policy().resolve("../outside.txt").is_err());
    }

    #[test]
    fn test_inner_traversal_that_stays_inside_is_accepted() {
        let resolved = policy().resolve("/workspace/a/../b/file.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/b/file.rs"));
    }

    #[test]
    fn test_outside_workspace_is_rejected() {
        assert!(policy().resolve("/home/user/file.rs").is_err());
    }

    #[test]
    fn test_restricted_prefixes_are_rejected() {
        for input in ["/etc/passwd", "/proc/self/maps", "/sys/kernel"] {
            let error = policy().resolve(input).unwrap_err();
            assert!(matches!(error, RouteError::Rejected { .. }), "{input}");
        }
    }

    #[test]
    fn test_blocked_segment_exact_not_substring() {
        let policy = policy();
        assert!(policy.resolve("/workspace/build").is_err());
        assert!(policy.resolve("/workspace/node_modules/pkg/index.js").is_err());
        assert!(policy.resolve("/workspace/.git/config").is_err());
        // Lookalike names are fine: the check is segment-equal.
        assert!(policy.resolve("/workspace/build_scripts.go").is_ok());
        assert!(policy.resolve("/workspace/distillery/run.rs").is_ok());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let policy = policy();
        let once = policy.resolve(r"C:\workspace\a\..\b\file.rs").unwrap();
        let twice = policy.resolve(&once.display().to_string()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_relative_root_is_a_config_error() {
        assert!(PathPolicy::new("relative/root").is_err());
    }

    #[test]
    fn test_diagnose_reports_each_check() {
        let report = policy().diagnose("/workspace/node_modules/x.js");
        assert!(report.resolved.is_none());
        let blocked = report
            .checks
            .iter()
            .find(|check| check.name == "blocked_segment")
            .unwrap();
        assert!(!blocked.passed);
        let traversal = report
            .checks
            .iter()
            .find(|check| check.name == "traversal")
            .unwrap();
        assert!(traversal.passed);
    }
}
