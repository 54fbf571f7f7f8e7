//! Safety and policy checks around patch application
//!
//! Preflight checks run before the application engine is ever invoked:
//! a violation skips apply entirely. Post-apply checks (syntax, optional
//! regression re-test) decide whether the iteration's changes survive.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SafetyViolation;
use crate::patch::{DiffLine, Patch};
use crate::syntax;

/// Process-wide safety policy, loaded once per run and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Cap on total added + removed lines per patch
    pub max_lines_changed: usize,
    /// Cap on distinct files a patch may touch
    pub max_files_modified: usize,
    /// Regex patterns for paths a patch must never touch
    pub denied_path_patterns: Vec<String>,
    /// Reject patches that edit test files
    pub forbid_test_edits: bool,
    /// Re-run previously passing tests after each apply
    pub regression_check: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_lines_changed: 200,
            max_files_modified: 5,
            denied_path_patterns: vec![
                r"^\.github/".to_string(),
                r"^\.gitlab-ci".to_string(),
                r"(^|/)\.git/".to_string(),
                r"\.lock$".to_string(),
                r"(^|/)\.env".to_string(),
                r"(^|/)secrets?(\.|/)".to_string(),
                r"^target/".to_string(),
                r"^node_modules/".to_string(),
                r"^dist/".to_string(),
            ],
            forbid_test_edits: true,
            regression_check: true,
        }
    }
}

/// Verdict on a patch before application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Rejected { reason: String },
}

impl ReviewDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ReviewDecision::Rejected {
            reason: reason.into(),
        }
    }
}

/// Run every preflight policy against a validated patch.
///
/// `repo_root` is consulted only to read the current content of touched
/// files for duplicate-definition detection; nothing is written.
pub fn preflight(
    patch: &Patch,
    repo_root: &Path,
    config: &SafetyConfig,
) -> Result<(), SafetyViolation> {
    check_paths(patch, config)?;
    check_size(patch, config)?;
    check_duplicate_definitions(patch, repo_root)?;
    Ok(())
}

fn check_paths(patch: &Patch, config: &SafetyConfig) -> Result<(), SafetyViolation> {
    let patterns: Vec<(String, Regex)> = config
        .denied_path_patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok().map(|re| (p.clone(), re)))
        .collect();

    for path in patch.touched_paths() {
        for (pattern, re) in &patterns {
            if re.is_match(path) {
                return Err(SafetyViolation::PathDenied {
                    path: path.to_string(),
                    pattern: pattern.clone(),
                });
            }
        }
        if config.forbid_test_edits && is_test_file(path) {
            return Err(SafetyViolation::TestFileEdit {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

/// Test-file naming conventions across the languages we repair.
pub fn is_test_file(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let in_test_dir = path.split('/').any(|seg| seg == "tests" || seg == "test" || seg == "__tests__");

    in_test_dir
        || file_name.starts_with("test_") && file_name.ends_with(".py")
        || file_name.ends_with("_test.py")
        || file_name.ends_with("_test.go")
        || file_name.ends_with(".test.ts")
        || file_name.ends_with(".test.js")
        || file_name.ends_with(".spec.ts")
        || file_name.ends_with(".spec.js")
        || file_name.ends_with("conftest.py")
}

fn check_size(patch: &Patch, config: &SafetyConfig) -> Result<(), SafetyViolation> {
    let lines = patch.lines_changed();
    if lines > config.max_lines_changed {
        return Err(SafetyViolation::SizeExceeded {
            actual: lines,
            limit: config.max_lines_changed,
        });
    }

    let files = patch.touched_paths().len();
    if files > config.max_files_modified {
        return Err(SafetyViolation::TooManyFiles {
            actual: files,
            limit: config.max_files_modified,
        });
    }
    Ok(())
}

/// Reject a patch that adds a definition already present in the target
/// file without removing the old one, the defect class behind silent
/// duplicate functions and non-convergent iteration.
fn check_duplicate_definitions(patch: &Patch, repo_root: &Path) -> Result<(), SafetyViolation> {
    for edit in &patch.edits {
        let path = edit.target_path();
        let mut added: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        for hunk in &edit.hunks {
            for line in &hunk.lines {
                match line {
                    DiffLine::Add(s) => added.extend(definition_name(s)),
                    DiffLine::Remove(s) => removed.extend(definition_name(s)),
                    DiffLine::Context(_) => {}
                }
            }
        }

        let new_symbols: Vec<&String> = added.iter().filter(|s| !removed.contains(s)).collect();
        if new_symbols.is_empty() {
            continue;
        }

        // A symbol added with no matching removal only duplicates if the
        // current file already defines it.
        let current = fs::read_to_string(repo_root.join(path)).unwrap_or_default();
        let existing: Vec<String> = current.lines().flat_map(definition_name).collect();

        for symbol in new_symbols {
            if existing.contains(symbol) {
                return Err(SafetyViolation::DuplicateDefinition {
                    path: path.to_string(),
                    symbol: symbol.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Extract the symbol a line defines, if any (`def`/`class`/`fn`/`function`).
fn definition_name(line: &str) -> Option<String> {
    let re = Regex::new(
        r"^\s*(?:pub\s+)?(?:async\s+)?(?:def|class|fn|function)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .ok()?;
    re.captures(line).map(|c| c[1].to_string())
}

/// Post-apply check: every changed file must still parse.
///
/// Returns the offending path and a description on failure; the caller
/// rolls back and reports, never swallows.
pub fn check_syntax(repo_root: &Path, changed_files: &[std::path::PathBuf]) -> Result<(), String> {
    for file in changed_files {
        let absolute = repo_root.join(file);
        if !absolute.exists() {
            // The patch deleted this file; nothing left to parse.
            continue;
        }
        let content = fs::read_to_string(&absolute)
            .map_err(|e| format!("{}: unreadable after apply ({})", file.display(), e))?;
        if syntax::has_syntax_errors(&absolute, &content) {
            return Err(format!("{}: parse error after apply", file.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse_patch;
    use std::path::PathBuf;

    fn patch_touching(path: &str) -> Patch {
        let raw = format!(
            "--- a/{p}\n+++ b/{p}\n@@ -1,1 +1,1 @@\n-old = 1\n+new = 1\n",
            p = path
        );
        parse_patch(&raw).unwrap()
    }

    #[test]
    fn test_ci_config_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let result = preflight(
            &patch_touching(".github/workflows/ci.yml"),
            dir.path(),
            &SafetyConfig::default(),
        );
        match result {
            Err(SafetyViolation::PathDenied { path, .. }) => assert!(path.contains("ci.yml")),
            other => panic!("CI config edit must be rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_lockfile_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let result = preflight(
            &patch_touching("Cargo.lock"),
            dir.path(),
            &SafetyConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_test_file_edit_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let result = preflight(
            &patch_touching("tests/test_calc.py"),
            dir.path(),
            &SafetyConfig::default(),
        );
        match result {
            Err(SafetyViolation::TestFileEdit { path }) => assert!(path.contains("test_calc")),
            other => panic!("test file edit must be rejected, got {:?}", other),
        }

        let mut permissive = SafetyConfig::default();
        permissive.forbid_test_edits = false;
        assert!(preflight(&patch_touching("tests/test_calc.py"), dir.path(), &permissive).is_ok());
    }

    #[test]
    fn test_is_test_file_conventions() {
        assert!(is_test_file("tests/test_calc.py"));
        assert!(is_test_file("pkg/calc_test.go"));
        assert!(is_test_file("src/app.test.ts"));
        assert!(is_test_file("conftest.py"));
        assert!(!is_test_file("src/calc.py"));
        assert!(!is_test_file("src/testing_utils.py"));
    }

    #[test]
    fn test_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SafetyConfig::default();
        config.max_lines_changed = 1;
        match preflight(&patch_touching("src/calc.py"), dir.path(), &config) {
            Err(SafetyViolation::SizeExceeded { actual, limit }) => {
                assert_eq!((actual, limit), (2, 1));
            }
            other => panic!("size cap must reject, got {:?}", other),
        }
    }

    #[test]
    fn test_file_count_cap() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "--- a/a.py\n+++ b/a.py\n@@ -1,1 +1,1 @@\n-x=1\n+x=2\n--- a/b.py\n+++ b/b.py\n@@ -1,1 +1,1 @@\n-y=1\n+y=2\n";
        let patch = parse_patch(raw).unwrap();
        let mut config = SafetyConfig::default();
        config.max_files_modified = 1;
        assert!(matches!(
            preflight(&patch, dir.path(), &config),
            Err(SafetyViolation::TooManyFiles { actual: 2, limit: 1 })
        ));
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("calc.py"),
            "def add(a, b):\n    return a - b\n",
        )
        .unwrap();

        // Adds `def add` without removing the existing one.
        let raw = "--- a/calc.py\n+++ b/calc.py\n@@ -2,1 +2,3 @@\n     return a - b\n+\n+def add(a, b):\n+    return a + b\n";
        let patch = parse_patch(raw).unwrap();
        match preflight(&patch, dir.path(), &SafetyConfig::default()) {
            Err(SafetyViolation::DuplicateDefinition { symbol, .. }) => assert_eq!(symbol, "add"),
            other => panic!("duplicate definition must be rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_replacement_definition_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("calc.py"),
            "def add(a, b):\n    return a - b\n",
        )
        .unwrap();

        // Removes the old definition as it adds the new one.
        let raw = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n-def add(a, b):\n-    return a - b\n+def add(a, b):\n+    return a + b\n";
        let patch = parse_patch(raw).unwrap();
        assert!(preflight(&patch, dir.path(), &SafetyConfig::default()).is_ok());
    }

    #[test]
    fn test_brand_new_helper_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), "x = 1\n").unwrap();

        let raw = "--- a/calc.py\n+++ b/calc.py\n@@ -1,1 +1,3 @@\n x = 1\n+def helper():\n+    return 2\n";
        let patch = parse_patch(raw).unwrap();
        assert!(preflight(&patch, dir.path(), &SafetyConfig::default()).is_ok());
    }

    #[test]
    fn test_check_syntax_flags_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("bad.py"), "def f(:\n").unwrap();

        assert!(check_syntax(dir.path(), &[PathBuf::from("ok.py")]).is_ok());
        let err = check_syntax(dir.path(), &[PathBuf::from("bad.py")]).unwrap_err();
        assert!(err.contains("bad.py"));

        // A file the patch deleted has nothing left to validate.
        assert!(check_syntax(dir.path(), &[PathBuf::from("gone.py")]).is_ok());
    }

    #[test]
    fn test_definition_name_variants() {
        assert_eq!(definition_name("def add(a, b):"), Some("add".to_string()));
        assert_eq!(definition_name("class Parser:"), Some("Parser".to_string()));
        assert_eq!(definition_name("pub fn apply() {"), Some("apply".to_string()));
        assert_eq!(definition_name("    async def go():"), Some("go".to_string()));
        assert_eq!(definition_name("x = define(1)"), None);
    }
}
