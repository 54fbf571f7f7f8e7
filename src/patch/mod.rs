//! Unified diff data model and parsing
//!
//! Parses raw diff text into structured `Patch` / `FileEdit` / `Hunk`
//! values. Repairing malformed LLM output lives in `fixer`; applying a
//! validated patch lives in `apply`.

pub mod apply;
pub mod fixer;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Count of (adds, removes) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Add(_)))
            .count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }

    /// Old-side line count actually present in the body (context + removed).
    pub fn actual_old_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Remove(_)))
            .count()
    }

    /// New-side line count actually present in the body (context + added).
    pub fn actual_new_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Add(_)))
            .count()
    }

    /// Overwrite the declared header counts with counts recomputed from the
    /// body. Declared counts from an LLM are never trusted.
    pub fn recount(&mut self) {
        self.old_count = self.actual_old_count();
        self.new_count = self.actual_new_count();
    }

    /// The old-side lines (context + removed) this hunk expects to find.
    pub fn expected_old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Remove(_)))
            .map(|l| l.content())
            .collect()
    }

    /// The new-side lines (context + added) this hunk produces.
    pub fn replacement_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Add(_)))
            .map(|l| l.content())
            .collect()
    }

    /// True if the hunk changes nothing (old side == new side).
    pub fn is_noop(&self) -> bool {
        self.expected_old_lines() == self.replacement_lines()
    }
}

/// All hunks against one target file
#[derive(Debug, Clone, PartialEq)]
pub struct FileEdit {
    /// Path from the `--- a/...` header, prefix stripped
    pub old_path: String,
    /// Path from the `+++ b/...` header, prefix stripped
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

impl FileEdit {
    /// The path this edit targets on disk.
    pub fn target_path(&self) -> &str {
        // /dev/null on the new side means deletion; prefer the real side.
        if self.new_path == "/dev/null" {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    pub fn summary(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

/// A parsed multi-file patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// The raw text the patch was parsed from
    pub raw: String,
    pub edits: Vec<FileEdit>,
}

impl Patch {
    /// Total (additions, deletions) across all files
    pub fn stats(&self) -> (usize, usize) {
        self.edits.iter().fold((0, 0), |acc, e| {
            let (a, r) = e.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    /// Total changed lines (added + removed)
    pub fn lines_changed(&self) -> usize {
        let (a, r) = self.stats();
        a + r
    }

    /// Distinct target paths, in patch order.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for edit in &self.edits {
            let p = edit.target_path();
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
        paths
    }
}

/// Strip the conventional `a/` / `b/` prefix and any timestamp suffix from
/// a diff header path.
pub fn clean_header_path(raw: &str) -> String {
    let mut path = raw.trim();
    if let Some(tab_pos) = path.find('\t') {
        path = &path[..tab_pos];
    }
    if path == "/dev/null" {
        return path.to_string();
    }
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Parse a patch that may touch several files.
///
/// Accepts both `diff --git` style and bare `---`/`+++` pairs. Returns an
/// error string when no file edit can be recovered; structural repair of
/// near-miss input belongs to `fixer`, not here.
pub fn parse_patch(raw: &str) -> Result<Patch, String> {
    let lines: Vec<&str> = raw.lines().collect();

    let mut edits = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("--- ") {
            let old_path = clean_header_path(&lines[i][4..]);
            if i + 1 >= lines.len() || !lines[i + 1].starts_with("+++ ") {
                return Err(format!("'---' header without matching '+++' at line {}", i + 1));
            }
            let new_path = clean_header_path(&lines[i + 1][4..]);
            i += 2;

            let mut hunks = Vec::new();
            while i < lines.len() && lines[i].starts_with("@@") {
                let hunk = parse_hunk(&lines, &mut i)?;
                hunks.push(hunk);
            }

            if hunks.is_empty() {
                return Err(format!("no hunks found for file '{}'", new_path));
            }

            edits.push(FileEdit {
                old_path,
                new_path,
                hunks,
            });
        } else {
            i += 1;
        }
    }

    if edits.is_empty() {
        return Err("no file edits found in patch".to_string());
    }

    Ok(Patch {
        raw: raw.to_string(),
        edits,
    })
}

/// Parse a single hunk starting at `lines[*idx]` (a `@@` header).
fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<Hunk, String> {
    let header = lines[*idx];

    // @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(format!("invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at the next hunk or the next file
        if line.starts_with("@@") || line.starts_with("diff ") || line.starts_with("--- ") {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
        } else if line.starts_with(' ') || line.is_empty() {
            // A blank line that lost its leading space in transport is an
            // empty context line, not a malformed line.
            let content = if line.is_empty() { "" } else { &line[1..] };
            diff_lines.push(DiffLine::Context(content.to_string()));
        }
        // Skip markers like "\ No newline at end of file"

        *idx += 1;
    }

    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some(comma) = s.find(',') {
        let start: usize = s[..comma]
            .parse()
            .map_err(|_| format!("invalid start: {}", s))?;
        let count: usize = s[comma + 1..]
            .parse()
            .map_err(|_| format!("invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_file_patch() {
        let diff = r#"--- a/src/example.py
+++ b/src/example.py
@@ -1,5 +1,6 @@
 def hello():
-    print("old")
+    print("new")
+    print("extra")
     return True
"#;
        let patch = parse_patch(diff).unwrap();
        assert_eq!(patch.edits.len(), 1);
        assert_eq!(patch.edits[0].old_path, "src/example.py");
        assert_eq!(patch.edits[0].new_path, "src/example.py");
        assert_eq!(patch.stats(), (2, 1));
    }

    #[test]
    fn test_parse_multi_file_patch() {
        let diff = r#"diff --git a/src/a.py b/src/a.py
--- a/src/a.py
+++ b/src/a.py
@@ -1,2 +1,2 @@
 import os
-x = 1
+x = 2
diff --git a/src/b.py b/src/b.py
--- a/src/b.py
+++ b/src/b.py
@@ -1 +1 @@
-y = 1
+y = 2
"#;
        let patch = parse_patch(diff).unwrap();
        assert_eq!(patch.edits.len(), 2);
        assert_eq!(patch.touched_paths(), vec!["src/a.py", "src/b.py"]);
        assert_eq!(patch.lines_changed(), 4);
    }

    #[test]
    fn test_recount_overwrites_declared_counts() {
        let diff = "--- a/f.py\n+++ b/f.py\n@@ -1,7 +1,7 @@\n context\n-old\n+new\n";
        let mut patch = parse_patch(diff).unwrap();
        let hunk = &mut patch.edits[0].hunks[0];
        assert_eq!(hunk.old_count, 7); // declared, wrong
        hunk.recount();
        assert_eq!(hunk.old_count, 2);
        assert_eq!(hunk.new_count, 2);
    }

    #[test]
    fn test_clean_header_path() {
        assert_eq!(clean_header_path("a/src/m.py"), "src/m.py");
        assert_eq!(clean_header_path("b/src/m.py\t2024-01-01"), "src/m.py");
        assert_eq!(clean_header_path("/dev/null"), "/dev/null");
        assert_eq!(clean_header_path("src/m.py"), "src/m.py");
    }

    #[test]
    fn test_blank_line_is_empty_context() {
        let diff = "--- a/f.py\n+++ b/f.py\n@@ -1,3 +1,3 @@\n before\n\n-old\n+new\n";
        let patch = parse_patch(diff).unwrap();
        let hunk = &patch.edits[0].hunks[0];
        assert_eq!(hunk.lines[1], DiffLine::Context(String::new()));
    }

    #[test]
    fn test_noop_hunk_detection() {
        let diff = "--- a/f.py\n+++ b/f.py\n@@ -1,2 +1,2 @@\n one\n two\n";
        let patch = parse_patch(diff).unwrap();
        assert!(patch.edits[0].hunks[0].is_noop());
    }

    #[test]
    fn test_rejects_headerless_text() {
        assert!(parse_patch("not a diff at all").is_err());
    }
}
