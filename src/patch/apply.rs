//! Tiered patch application
//!
//! Tier 1 applies hunks only where every old-side line matches the file
//! byte-for-byte at the declared offset. Tier 2 searches a bounded window
//! around the declared offset, comparing with trailing inline comments
//! stripped (the file's actual bytes are what gets replaced). Tier 3
//! retries alternate target paths derived from discovered source roots.
//! Tier 4 reconstructs the edit against live file content and retries.
//!
//! All writes for one patch are staged and committed together: if any edit
//! fails every tier, the working tree is left untouched.

use std::fs;
use std::path::{Path, PathBuf};

use super::fixer::reconstruct_edit;
use super::{DiffLine, FileEdit, Hunk, Patch};
use crate::util::resolve_repo_path_allow_new;

/// Fuzzy-match search distance around a hunk's declared offset, in lines.
const FUZZY_WINDOW: usize = 10;

/// Successful application of a whole patch.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Repo-relative paths whose content actually changed.
    pub changed_files: Vec<PathBuf>,
}

/// All tiers exhausted for some edit; nothing was written.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

pub struct ApplyEngine<'a> {
    repo_root: &'a Path,
    /// Discovered source roots, repo-relative (e.g. `src`). Used for
    /// path-prefix recovery, never hardcoded.
    source_roots: &'a [PathBuf],
}

impl<'a> ApplyEngine<'a> {
    pub fn new(repo_root: &'a Path, source_roots: &'a [PathBuf]) -> Self {
        Self {
            repo_root,
            source_roots,
        }
    }

    /// Apply every edit in the patch, or nothing at all.
    pub fn apply(&self, patch: &Patch) -> Result<ApplyOutcome, ApplyFailure> {
        // Staged content of None means the file is deleted.
        let mut staged: Vec<(PathBuf, PathBuf, Option<String>)> = Vec::new();

        for edit in &patch.edits {
            let declared = edit.target_path();

            if edit.old_path == "/dev/null" {
                // New file: content is the added lines, verbatim.
                let resolved = resolve_repo_path_allow_new(self.repo_root, Path::new(declared))
                    .map_err(|e| ApplyFailure {
                        path: declared.to_string(),
                        reason: e,
                    })?;
                let content = new_file_content(edit);
                staged.push((resolved.absolute, resolved.relative, Some(content)));
                continue;
            }

            let (absolute, relative) = self.locate_target(declared).ok_or_else(|| ApplyFailure {
                path: declared.to_string(),
                reason: "target file not found (after path-prefix recovery)".to_string(),
            })?;

            if edit.new_path == "/dev/null" {
                staged.push((absolute, relative, None));
                continue;
            }

            let original = fs::read_to_string(&absolute).map_err(|e| ApplyFailure {
                path: declared.to_string(),
                reason: format!("failed to read target: {}", e),
            })?;

            let patched = self.apply_edit(&original, edit).map_err(|reason| ApplyFailure {
                path: declared.to_string(),
                reason,
            })?;

            if patched != original {
                staged.push((absolute, relative, Some(patched)));
            }
        }

        // Every edit succeeded; commit the stage.
        let mut changed_files = Vec::new();
        for (absolute, relative, content) in staged {
            match content {
                Some(content) => {
                    if let Some(parent) = absolute.parent() {
                        fs::create_dir_all(parent).map_err(|e| ApplyFailure {
                            path: relative.display().to_string(),
                            reason: format!("failed to create parent dir: {}", e),
                        })?;
                    }
                    fs::write(&absolute, content).map_err(|e| ApplyFailure {
                        path: relative.display().to_string(),
                        reason: format!("failed to write: {}", e),
                    })?;
                }
                None => {
                    fs::remove_file(&absolute).map_err(|e| ApplyFailure {
                        path: relative.display().to_string(),
                        reason: format!("failed to delete: {}", e),
                    })?;
                }
            }
            changed_files.push(relative);
        }

        Ok(ApplyOutcome { changed_files })
    }

    /// Tiers 1, 2 and 4 for a single file's content.
    fn apply_edit(&self, original: &str, edit: &FileEdit) -> Result<String, String> {
        let exact_err = match apply_hunks(original, &edit.hunks, MatchMode::Exact) {
            Ok(content) => return Ok(content),
            Err(e) => e,
        };
        let fuzzy_err = match apply_hunks(original, &edit.hunks, MatchMode::Fuzzy) {
            Ok(content) => return Ok(content),
            Err(e) => e,
        };

        // Tier 4: rebuild the edit from what the hunks imply, anchored by
        // content in the live file, then retry exact.
        if let Some(rebuilt) = reconstruct_edit(original, edit) {
            if let Ok(content) = apply_hunks(original, &rebuilt.hunks, MatchMode::Exact) {
                return Ok(content);
            }
        }

        Err(format!(
            "all tiers exhausted (exact: {}; fuzzy: {}; reconstruction failed)",
            exact_err, fuzzy_err
        ))
    }

    /// Tier 3: find where the declared path actually lives.
    ///
    /// Tries the path as given, then with a leading repo-directory segment
    /// stripped, then under each discovered source root.
    fn locate_target(&self, declared: &str) -> Option<(PathBuf, PathBuf)> {
        let mut candidates: Vec<PathBuf> = vec![PathBuf::from(declared)];

        if let Some(repo_name) = self.repo_root.file_name().and_then(|n| n.to_str()) {
            if let Some(stripped) = declared.strip_prefix(&format!("{}/", repo_name)) {
                candidates.push(PathBuf::from(stripped));
            }
        }

        let bare: Vec<PathBuf> = candidates.clone();
        for root in self.source_roots {
            for candidate in &bare {
                if !candidate.starts_with(root) {
                    candidates.push(root.join(candidate));
                }
            }
        }

        for candidate in candidates {
            if let Ok(resolved) = resolve_repo_path_allow_new(self.repo_root, &candidate) {
                if resolved.absolute.is_file() {
                    return Some((resolved.absolute, resolved.relative));
                }
            }
        }
        None
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Exact,
    Fuzzy,
}

/// Apply hunks in reverse order so earlier replacements don't shift the
/// offsets of later ones.
fn apply_hunks(original: &str, hunks: &[Hunk], mode: MatchMode) -> Result<String, String> {
    let had_trailing_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

    for hunk in hunks.iter().rev() {
        lines = apply_one_hunk(lines, hunk, mode)?;
    }

    let mut result = lines.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn apply_one_hunk(lines: Vec<String>, hunk: &Hunk, mode: MatchMode) -> Result<Vec<String>, String> {
    let expected = hunk.expected_old_lines();
    let declared_start = hunk.old_start.saturating_sub(1);

    if expected.is_empty() {
        // Context-free pure insertion. An `-N,0` range means "insert after
        // line N", so the 0-based insertion index is N itself.
        let at = hunk.old_start.min(lines.len());
        let mut out = lines;
        let additions: Vec<String> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Add(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        out.splice(at..at, additions);
        return Ok(out);
    }

    let position = match mode {
        MatchMode::Exact => {
            let end = declared_start.checked_add(expected.len()).filter(|e| *e <= lines.len());
            match end {
                Some(end)
                    if lines[declared_start..end]
                        .iter()
                        .zip(&expected)
                        .all(|(a, b)| a == b) =>
                {
                    Some(declared_start)
                }
                _ => None,
            }
        }
        MatchMode::Fuzzy => find_fuzzy(&lines, &expected, declared_start),
    };

    let position = position.ok_or_else(|| {
        format!(
            "hunk at line {} does not match file content ({} mode)",
            hunk.old_start,
            match mode {
                MatchMode::Exact => "exact",
                MatchMode::Fuzzy => "fuzzy",
            }
        )
    })?;

    // Build the replacement, consuming the matched file region: context
    // lines keep the file's actual bytes so a comment-only difference in
    // the patch never rewrites the file's comments.
    let mut replacement = Vec::new();
    let mut cursor = position;
    for diff_line in &hunk.lines {
        match diff_line {
            DiffLine::Context(_) => {
                replacement.push(lines[cursor].clone());
                cursor += 1;
            }
            DiffLine::Remove(_) => {
                cursor += 1;
            }
            DiffLine::Add(s) => {
                replacement.push(s.clone());
            }
        }
    }

    let mut out = lines;
    out.splice(position..cursor, replacement);
    Ok(out)
}

/// Search a bounded window around the declared offset for a contiguous run
/// matching the expected old lines, comparing with trailing inline
/// comments stripped on both sides.
fn find_fuzzy(lines: &[String], expected: &[&str], declared_start: usize) -> Option<usize> {
    if expected.len() > lines.len() {
        return None;
    }
    let lo = declared_start.saturating_sub(FUZZY_WINDOW);
    let hi = (declared_start + FUZZY_WINDOW).min(lines.len() - expected.len());

    (lo..=hi).find(|&pos| {
        lines[pos..pos + expected.len()]
            .iter()
            .zip(expected)
            .all(|(a, b)| lines_match_ignoring_comments(a, b))
    })
}

fn lines_match_ignoring_comments(a: &str, b: &str) -> bool {
    strip_inline_comment(a).trim_end() == strip_inline_comment(b).trim_end()
}

/// Drop a trailing `# ...` or `// ...` comment. Comparison only; the
/// stripped form is never written back.
fn strip_inline_comment(line: &str) -> &str {
    for marker in [" #", "\t#", " //", "\t//"] {
        if let Some(pos) = line.find(marker) {
            return &line[..pos];
        }
    }
    line
}

fn new_file_content(edit: &FileEdit) -> String {
    let mut content = String::new();
    for hunk in &edit.hunks {
        for line in &hunk.lines {
            if let DiffLine::Add(s) = line {
                content.push_str(s);
                content.push('\n');
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse_patch;
    use std::fs;

    fn write_repo_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn simple_patch(path: &str) -> Patch {
        let raw = format!(
            "--- a/{p}\n+++ b/{p}\n@@ -1,3 +1,3 @@\n def f():\n-    return 1\n+    return 2\n # end\n",
            p = path
        );
        parse_patch(&raw).unwrap()
    }

    #[test]
    fn test_exact_apply() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "m.py", "def f():\n    return 1\n# end\n");

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&simple_patch("m.py")).unwrap();

        assert_eq!(outcome.changed_files, vec![PathBuf::from("m.py")]);
        let content = fs::read_to_string(dir.path().join("m.py")).unwrap();
        assert!(content.contains("return 2"));
        assert!(!content.contains("return 1"));
    }

    #[test]
    fn test_fuzzy_apply_with_offset_drift() {
        let dir = tempfile::tempdir().unwrap();
        // Four extra lines at the top shift everything; declared offsets
        // are stale but within the window.
        write_repo_file(
            dir.path(),
            "m.py",
            "import os\nimport sys\nimport re\nimport io\ndef f():\n    return 1\n# end\n",
        );

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&simple_patch("m.py")).unwrap();

        assert_eq!(outcome.changed_files.len(), 1);
        let content = fs::read_to_string(dir.path().join("m.py")).unwrap();
        assert!(content.contains("return 2"));
        assert!(content.starts_with("import os\n"));
    }

    #[test]
    fn test_fuzzy_preserves_file_comments() {
        let dir = tempfile::tempdir().unwrap();
        // File has an inline comment the patch's context line lacks.
        write_repo_file(
            dir.path(),
            "m.py",
            "def f():  # entry point\n    return 1\n# end\n",
        );

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        engine.apply(&simple_patch("m.py")).unwrap();

        let content = fs::read_to_string(dir.path().join("m.py")).unwrap();
        // The file's own comment survives; only the removed line changed.
        assert!(content.contains("def f():  # entry point"));
        assert!(content.contains("return 2"));
    }

    #[test]
    fn test_path_prefix_recovery() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "src/m.py", "def f():\n    return 1\n# end\n");

        // Patch says `m.py`; the file lives under the discovered `src` root.
        let roots = vec![PathBuf::from("src")];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&simple_patch("m.py")).unwrap();

        assert_eq!(outcome.changed_files, vec![PathBuf::from("src/m.py")]);
    }

    #[test]
    fn test_repo_name_prefix_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("checkout");
        fs::create_dir_all(&repo).unwrap();
        write_repo_file(&repo, "m.py", "def f():\n    return 1\n# end\n");

        let roots = vec![];
        let engine = ApplyEngine::new(&repo, &roots);
        let outcome = engine.apply(&simple_patch("checkout/m.py")).unwrap();

        assert_eq!(outcome.changed_files, vec![PathBuf::from("m.py")]);
    }

    #[test]
    fn test_no_partial_application() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "a.py", "x = 1\n");

        // Second edit targets a file that does not exist anywhere.
        let raw = "--- a/a.py\n+++ b/a.py\n@@ -1,1 +1,1 @@\n-x = 1\n+x = 2\n--- a/missing.py\n+++ b/missing.py\n@@ -1,1 +1,1 @@\n-y = 1\n+y = 2\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        assert!(engine.apply(&patch).is_err());

        // First file untouched.
        let content = fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert_eq!(content, "x = 1\n");
    }

    #[test]
    fn test_noop_patch_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "m.py", "a = 1\nb = 2\n");

        let raw = "--- a/m.py\n+++ b/m.py\n@@ -1,2 +1,2 @@\n a = 1\n b = 2\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&patch).unwrap();
        assert!(outcome.changed_files.is_empty());
    }

    #[test]
    fn test_zero_length_range_inserts_after_declared_line() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "m.py", "a = 1\nb = 2\nc = 3\n");

        // `-2,0` means the new line lands after line 2, not before it.
        let raw = "--- a/m.py\n+++ b/m.py\n@@ -2,0 +3,1 @@\n+x = 9\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        engine.apply(&patch).unwrap();

        let content = fs::read_to_string(dir.path().join("m.py")).unwrap();
        assert_eq!(content, "a = 1\nb = 2\nx = 9\nc = 3\n");
    }

    #[test]
    fn test_zero_length_range_at_file_start() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "m.py", "a = 1\n");

        let raw = "--- a/m.py\n+++ b/m.py\n@@ -0,0 +1,1 @@\n+import os\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        engine.apply(&patch).unwrap();

        let content = fs::read_to_string(dir.path().join("m.py")).unwrap();
        assert_eq!(content, "import os\na = 1\n");
    }

    #[test]
    fn test_file_deletion() {
        let dir = tempfile::tempdir().unwrap();
        write_repo_file(dir.path(), "old.py", "x = 1\n");
        write_repo_file(dir.path(), "keep.py", "y = 1\n");

        let raw = "--- a/old.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-x = 1\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&patch).unwrap();

        assert_eq!(outcome.changed_files, vec![PathBuf::from("old.py")]);
        assert!(!dir.path().join("old.py").exists());
        assert!(dir.path().join("keep.py").exists());
    }

    #[test]
    fn test_deleting_missing_file_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();

        let raw = "--- a/ghost.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-x = 1\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        assert!(engine.apply(&patch).is_err());
    }

    #[test]
    fn test_new_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "--- /dev/null\n+++ b/helper.py\n@@ -0,0 +1,2 @@\n+def help():\n+    return True\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&patch).unwrap();

        assert_eq!(outcome.changed_files, vec![PathBuf::from("helper.py")]);
        let content = fs::read_to_string(dir.path().join("helper.py")).unwrap();
        assert_eq!(content, "def help():\n    return True\n");
    }

    #[test]
    fn test_reconstruction_tier() {
        let dir = tempfile::tempdir().unwrap();
        // Far beyond the fuzzy window and with context lines the patch
        // doesn't know about: only reconstruction can anchor this.
        let mut content = String::new();
        for i in 0..40 {
            content.push_str(&format!("filler_{} = {}\n", i, i));
        }
        content.push_str("def f():\n    return 1\n");
        write_repo_file(dir.path(), "m.py", &content);

        let raw =
            "--- a/m.py\n+++ b/m.py\n@@ -1,2 +1,2 @@\n-def f():\n-    return 1\n+def f():\n+    return 2\n";
        let patch = parse_patch(raw).unwrap();

        let roots = vec![];
        let engine = ApplyEngine::new(dir.path(), &roots);
        let outcome = engine.apply(&patch).unwrap();

        assert_eq!(outcome.changed_files.len(), 1);
        let result = fs::read_to_string(dir.path().join("m.py")).unwrap();
        assert!(result.contains("return 2"));
        assert!(result.contains("filler_39"));
    }
}
