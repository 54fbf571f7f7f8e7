//! Patch validation and repair
//!
//! LLM-produced diffs routinely arrive with markdown fences, miscounted
//! hunk headers, missing header prefixes, or a truncated tail. This pass
//! parses the raw text, mechanically repairs what it can, and flags what
//! it cannot. Declared hunk counts are always recomputed from the body;
//! a miscounted header is the dominant cause of apply failure.

use super::{clean_header_path, parse_patch, DiffLine, FileEdit, Hunk, Patch};

/// Context lines included on each side of a reconstructed hunk.
const RECONSTRUCT_CONTEXT: usize = 3;

/// Outcome of `validate_and_fix`.
#[derive(Debug, Clone)]
pub enum FixOutcome {
    /// Patch parsed (possibly after repair) and is structurally sound.
    Clean(Patch),
    /// Patch parsed but the tail looks cut off; reconstruction against the
    /// live file is required before applying.
    Truncated(Patch),
    /// Nothing usable could be recovered. Carries the reason.
    Unparseable(String),
}

/// Parse raw LLM output into a structurally valid patch, repairing common
/// malformations along the way.
pub fn validate_and_fix(raw: &str) -> FixOutcome {
    let stripped = strip_noise(raw);
    if stripped.trim().is_empty() {
        return FixOutcome::Unparseable("response contained no diff content".to_string());
    }

    let normalized = normalize_headers(&stripped);

    let mut patch = match parse_patch(&normalized) {
        Ok(p) => p,
        Err(e) => return FixOutcome::Unparseable(e),
    };

    // Truncation must be judged against the counts the LLM declared,
    // before recomputation erases the evidence.
    let truncated = last_hunk_truncated(&patch) || tail_looks_cut(raw);

    for edit in &mut patch.edits {
        for hunk in &mut edit.hunks {
            hunk.recount();
        }
        // Drop hunks whose body vanished entirely (e.g. a header that was
        // the very last line of a truncated response).
        edit.hunks.retain(|h| !h.lines.is_empty());
    }
    patch.edits.retain(|e| !e.hunks.is_empty());

    if patch.edits.is_empty() {
        return FixOutcome::Unparseable("all hunks were empty after repair".to_string());
    }

    if truncated {
        FixOutcome::Truncated(patch)
    } else {
        FixOutcome::Clean(patch)
    }
}

/// Remove markdown fences and non-diff garbage from both ends of the text.
fn strip_noise(raw: &str) -> String {
    let all: Vec<&str> = raw.lines().collect();

    // Everything before the first file header or `diff --git` line is prose.
    let start = all
        .iter()
        .position(|l| looks_like_old_header(l) || l.trim_start().starts_with("diff --git"));
    let mut lines: Vec<&str> = match start {
        Some(s) => all[s..].to_vec(),
        None => return String::new(),
    };

    // Trailing fence, stray punctuation (a lone `%` from a shell prompt is
    // common), and closing prose
    while let Some(last) = lines.last() {
        if last.trim_start().starts_with("```") || !is_diff_line(last) {
            lines.pop();
        } else {
            break;
        }
    }

    lines.join("\n")
}

/// A `---` file header, as opposed to a `----` separator or prose.
fn looks_like_old_header(line: &str) -> bool {
    let t = line.trim_start();
    match t.strip_prefix("---") {
        Some(rest) => !rest.trim().is_empty() && !rest.chars().all(|c| c == '-'),
        None => false,
    }
}

/// True if this line belongs in the body of a unified diff.
fn is_diff_line(line: &str) -> bool {
    line.starts_with("--- ")
        || line.starts_with("+++ ")
        || line.starts_with("@@")
        || line.starts_with('+')
        || line.starts_with('-')
        || line.starts_with(' ')
        || line.starts_with("diff ")
        || line.starts_with("index ")
        || line.starts_with('\\')
        || line.is_empty()
}

/// Repair file header lines: restore the space after `---`/`+++` and
/// synthesize a missing `+++` from the `---` path.
fn normalize_headers(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        let fixed = fix_header_spacing(line);

        if let Some(path) = fixed.strip_prefix("--- ") {
            let next = lines.get(i + 1).map(|l| fix_header_spacing(l));
            let has_new_side = next.as_deref().is_some_and(|l| l.starts_with("+++ "));
            out.push(fixed.clone());
            if !has_new_side {
                // Bare old-side header: mirror the path onto the new side.
                out.push(format!("+++ b/{}", clean_header_path(path)));
            }
            i += 1;
            continue;
        }

        out.push(fixed);
        i += 1;
    }

    out.join("\n")
}

/// `---a/x` and `---  a/x` both become `--- a/x`.
fn fix_header_spacing(line: &str) -> String {
    for prefix in ["---", "+++"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            if rest.starts_with("--") || rest.starts_with("++") {
                // A separator line like "-----", not a header.
                return line.to_string();
            }
            let path = rest.trim_start();
            if !path.is_empty() && !line.starts_with(&format!("{} ", prefix)) {
                return format!("{} {}", prefix, path);
            }
            if rest.starts_with("  ") {
                return format!("{} {}", prefix, path);
            }
        }
    }
    line.to_string()
}

/// Did the final hunk declare materially more lines than its body holds?
fn last_hunk_truncated(patch: &Patch) -> bool {
    let last_edit = match patch.edits.last() {
        Some(e) => e,
        None => return false,
    };
    let last_hunk = match last_edit.hunks.last() {
        Some(h) => h,
        None => return false,
    };

    let declared_old = last_hunk.old_count;
    let declared_new = last_hunk.new_count;
    let actual_old = last_hunk.actual_old_count();
    let actual_new = last_hunk.actual_new_count();

    // One line of slack: off-by-one headers are miscounts, not truncation.
    declared_old > actual_old + 1 || declared_new > actual_new + 1
}

/// Does the raw text end mid-token (no trailing newline, last line not a
/// plausible complete diff line)?
fn tail_looks_cut(raw: &str) -> bool {
    if raw.ends_with('\n') {
        return false;
    }
    match raw.lines().last() {
        Some(last) => {
            let t = last.trim_end();
            // A bare sign with nothing after it, or a header fragment.
            t == "+" || t == "-" || t.starts_with("@@") && !t.ends_with("@@")
        }
        None => false,
    }
}

/// Regenerate a minimal, correctly counted edit directly against the
/// current file content.
///
/// Extracts the (old block, new block) replacement implied by each hunk,
/// locates the old block in `current` by content (never by the stale line
/// numbers in the original patch), and emits a fresh hunk with a fixed
/// context window around the true location. Returns `None` when no hunk
/// can be anchored.
pub fn reconstruct_edit(current: &str, edit: &FileEdit) -> Option<FileEdit> {
    let file_lines: Vec<&str> = current.lines().collect();
    let mut rebuilt: Vec<Hunk> = Vec::new();

    for hunk in &edit.hunks {
        if let Some(new_hunk) = reconstruct_hunk(&file_lines, hunk) {
            rebuilt.push(new_hunk);
        }
    }

    if rebuilt.is_empty() {
        return None;
    }

    rebuilt.sort_by_key(|h| h.old_start);

    Some(FileEdit {
        old_path: edit.old_path.clone(),
        new_path: edit.new_path.clone(),
        hunks: rebuilt,
    })
}

fn reconstruct_hunk(file_lines: &[&str], hunk: &Hunk) -> Option<Hunk> {
    let removed: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Remove(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let added: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Add(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();

    if removed.is_empty() && added.is_empty() {
        return None;
    }

    let (anchor, anchor_len) = if removed.is_empty() {
        // Pure insertion: anchor on the context line immediately before the
        // first added line, insert after it.
        let before = context_before_first_add(hunk)?;
        let pos = find_line(file_lines, before)?;
        (pos, 1)
    } else {
        let pos = find_block(file_lines, &removed)?;
        (pos, removed.len())
    };

    let ctx_start = anchor.saturating_sub(RECONSTRUCT_CONTEXT);
    let ctx_end = (anchor + anchor_len + RECONSTRUCT_CONTEXT).min(file_lines.len());

    let mut lines = Vec::new();
    for line in &file_lines[ctx_start..anchor] {
        lines.push(DiffLine::Context(line.to_string()));
    }
    if removed.is_empty() {
        // The anchor context line itself, then the insertion.
        lines.push(DiffLine::Context(file_lines[anchor].to_string()));
        for line in &added {
            lines.push(DiffLine::Add(line.to_string()));
        }
        for line in &file_lines[anchor + 1..ctx_end] {
            lines.push(DiffLine::Context(line.to_string()));
        }
    } else {
        // Remove the real file bytes at the match, not the patch's version.
        for line in &file_lines[anchor..anchor + anchor_len] {
            lines.push(DiffLine::Remove(line.to_string()));
        }
        for line in &added {
            lines.push(DiffLine::Add(line.to_string()));
        }
        for line in &file_lines[anchor + anchor_len..ctx_end] {
            lines.push(DiffLine::Context(line.to_string()));
        }
    }

    let mut rebuilt = Hunk {
        old_start: ctx_start + 1,
        old_count: 0,
        new_start: ctx_start + 1,
        new_count: 0,
        lines,
    };
    rebuilt.recount();
    Some(rebuilt)
}

fn context_before_first_add(hunk: &Hunk) -> Option<&str> {
    let mut last_context = None;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(s) => last_context = Some(s.as_str()),
            DiffLine::Add(_) => return last_context,
            DiffLine::Remove(_) => {}
        }
    }
    None
}

fn find_line(file_lines: &[&str], needle: &str) -> Option<usize> {
    file_lines
        .iter()
        .position(|l| *l == needle)
        .or_else(|| file_lines.iter().position(|l| l.trim() == needle.trim()))
}

fn find_block(file_lines: &[&str], block: &[&str]) -> Option<usize> {
    if block.is_empty() || block.len() > file_lines.len() {
        return None;
    }
    let exact = file_lines
        .windows(block.len())
        .position(|w| w.iter().zip(block).all(|(a, b)| a == b));
    if exact.is_some() {
        return exact;
    }
    // Whitespace-tolerant fallback
    file_lines
        .windows(block.len())
        .position(|w| w.iter().zip(block).all(|(a, b)| a.trim() == b.trim()))
}
