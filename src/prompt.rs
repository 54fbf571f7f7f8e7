//! Prompt construction for the plan / generate / critic steps
//!
//! Keeps every prompt small and mechanical: failing tests, resolved source
//! context, and the previous iteration's rejection feedback.

use std::path::PathBuf;

use crate::guard::ReviewDecision;
use crate::testing::FailingTest;
use crate::util::truncate;

/// Cap per embedded source file; repair context, not a code dump.
const MAX_FILE_CHARS: usize = 12_000;

/// Resolved source files sent as context: (repo-relative path, content).
pub type SourceContext = Vec<(PathBuf, String)>;

pub fn plan_system() -> String {
    "You are a software repair assistant. You will be shown failing tests from a repository. \
     Respond with a short, concrete fix strategy: which source file is at fault, what is wrong, \
     and what minimal change fixes it. Never propose editing test files. A few sentences, no code."
        .to_string()
}

pub fn patch_system() -> String {
    "You are a software repair assistant. Produce a minimal unified diff that makes the failing \
     tests pass. Rules: output only the diff, in a ```diff fence; use a/ and b/ path prefixes; \
     never edit test files; change as little as possible; do not reformat unrelated code."
        .to_string()
}

pub fn critic_system() -> String {
    "You are reviewing a patch before it is applied. Check: does it plausibly fix the failing \
     tests, does it avoid touching test files, is it minimal? Reply with exactly one line \
     starting with APPROVE or REJECT, followed by a short reason."
        .to_string()
}

pub fn build_plan_prompt(
    failing: &[FailingTest],
    sources: &SourceContext,
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();
    push_failing_tests(&mut prompt, failing);
    push_sources(&mut prompt, sources);

    if let Some(feedback) = feedback {
        prompt.push_str("\n## Previous attempt feedback\n");
        prompt.push_str(feedback);
        prompt.push('\n');
    }

    prompt.push_str("\nGive a short fix strategy.\n");
    prompt
}

pub fn build_patch_prompt(plan: &str, failing: &[FailingTest], sources: &SourceContext) -> String {
    let mut prompt = String::new();
    prompt.push_str("## Fix strategy\n");
    prompt.push_str(plan);
    prompt.push('\n');

    push_failing_tests(&mut prompt, failing);
    push_sources(&mut prompt, sources);

    prompt.push_str("\nProduce the unified diff now.\n");
    prompt
}

pub fn build_critic_prompt(patch_text: &str, failing: &[FailingTest]) -> String {
    let mut prompt = String::new();
    push_failing_tests(&mut prompt, failing);
    prompt.push_str("\n## Proposed patch\n```diff\n");
    prompt.push_str(patch_text);
    prompt.push_str("\n```\n\nAPPROVE or REJECT?\n");
    prompt
}

fn push_failing_tests(prompt: &mut String, failing: &[FailingTest]) {
    prompt.push_str("## Failing tests\n");
    for test in failing {
        prompt.push_str(&format!("- {}", test.id));
        if !test.message.is_empty() {
            prompt.push_str(&format!(": {}", test.message));
        }
        prompt.push('\n');
        if !test.trace.is_empty() {
            prompt.push_str("```\n");
            prompt.push_str(&test.trace);
            prompt.push_str("\n```\n");
        }
    }
}

fn push_sources(prompt: &mut String, sources: &SourceContext) {
    if sources.is_empty() {
        return;
    }
    prompt.push_str("\n## Source files\n");
    for (path, content) in sources {
        prompt.push_str(&format!("### {}\n```\n", path.display()));
        prompt.push_str(&truncate(content, MAX_FILE_CHARS));
        prompt.push_str("\n```\n");
    }
}

/// Pull the diff out of an LLM response: the first fenced ```diff (or
/// plain ```) block when present, otherwise the whole response. Structural
/// repair of what's inside belongs to the patch fixer.
pub fn extract_diff(response: &str) -> String {
    let lines: Vec<&str> = response.lines().collect();

    let open = lines.iter().position(|l| {
        let t = l.trim();
        t == "```diff" || t == "```patch" || t == "```"
    });

    if let Some(open) = open {
        let close = lines[open + 1..]
            .iter()
            .position(|l| l.trim().starts_with("```"))
            .map(|p| open + 1 + p)
            .unwrap_or(lines.len());
        let block = lines[open + 1..close].join("\n");
        if block.contains("---") || block.contains("@@") {
            return block;
        }
    }

    response.to_string()
}

/// Parse the critic's one-line verdict. An unreadable verdict approves:
/// the critic is advisory, the guard is not.
pub fn parse_critic_verdict(response: &str) -> ReviewDecision {
    let first = response.trim().lines().next().unwrap_or("").trim();
    let upper = first.to_uppercase();
    if upper.starts_with("REJECT") {
        let reason = first
            .splitn(2, |c: char| c.is_whitespace() || c == ':')
            .nth(1)
            .unwrap_or("critic gave no reason")
            .trim()
            .to_string();
        ReviewDecision::rejected(if reason.is_empty() {
            "critic gave no reason".to_string()
        } else {
            reason
        })
    } else {
        ReviewDecision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> Vec<FailingTest> {
        vec![FailingTest {
            id: "tests/test_calc.py::test_add".to_string(),
            file: Some(PathBuf::from("tests/test_calc.py")),
            message: "assert 0 == 2".to_string(),
            trace: "E  assert 0 == 2".to_string(),
        }]
    }

    #[test]
    fn test_plan_prompt_includes_feedback() {
        let prompt = build_plan_prompt(&failing(), &Vec::new(), Some("patch touched a test file"));
        assert!(prompt.contains("test_add"));
        assert!(prompt.contains("patch touched a test file"));
    }

    #[test]
    fn test_patch_prompt_embeds_sources() {
        let sources = vec![(PathBuf::from("src/calc.py"), "def add(a, b):\n".to_string())];
        let prompt = build_patch_prompt("fix add", &failing(), &sources);
        assert!(prompt.contains("src/calc.py"));
        assert!(prompt.contains("def add"));
    }

    #[test]
    fn test_extract_diff_from_fence() {
        let response = "Here you go:\n```diff\n--- a/f.py\n+++ b/f.py\n@@ -1 +1 @@\n-x\n+y\n```\nDone.";
        let diff = extract_diff(response);
        assert!(diff.starts_with("--- a/f.py"));
        assert!(!diff.contains("Done."));
    }

    #[test]
    fn test_extract_diff_bare_response() {
        let response = "--- a/f.py\n+++ b/f.py\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(extract_diff(response), response);
    }

    #[test]
    fn test_critic_verdicts() {
        assert_eq!(
            parse_critic_verdict("APPROVE - looks minimal"),
            ReviewDecision::Approved
        );
        match parse_critic_verdict("REJECT: touches unrelated code") {
            ReviewDecision::Rejected { reason } => assert!(reason.contains("unrelated")),
            _ => panic!("expected rejection"),
        }
        // Advisory critic: garbage output approves
        assert_eq!(parse_critic_verdict("hmm, not sure"), ReviewDecision::Approved);
    }
}
