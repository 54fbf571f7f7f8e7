//! Test runner detection and execution
//!
//! Detects project type, runs the appropriate suite under a wall-clock
//! deadline, and parses failures into structured `FailingTest` records.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;

use crate::util::{run_command_with_timeout, truncate};

/// Longest traceback excerpt carried per failing test.
const MAX_TRACE_CHARS: usize = 1200;

/// One failing test, as reported by the runner. Immutable per iteration;
/// a fresh set is produced after every test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingTest {
    /// Runner-native identifier, e.g. `tests/test_calc.py::test_add`
    pub id: String,
    /// Test file path when the identifier reveals it
    pub file: Option<PathBuf>,
    /// One-line error message
    pub message: String,
    /// Short traceback / output excerpt
    pub trace: String,
}

/// Result of one test run
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub passed: Vec<String>,
    pub failed: Vec<FailingTest>,
    pub timed_out: bool,
}

impl TestReport {
    pub fn all_green(&self) -> bool {
        !self.timed_out && self.failed.is_empty()
    }
}

/// What to run: the whole suite, or a bounded subset (used for regression
/// re-checks of previously passing tests).
#[derive(Debug, Clone)]
pub enum TestScope {
    Full,
    Subset(Vec<String>),
}

/// Test-runner collaborator consumed by the orchestrator.
pub trait TestRunner {
    fn run(&self, scope: &TestScope) -> Result<TestReport>;
}

/// Detected project type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Node,
    Python,
    Go,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Rust => "Rust",
            ProjectType::Node => "Node.js",
            ProjectType::Python => "Python",
            ProjectType::Go => "Go",
            ProjectType::Unknown => "Unknown",
        }
    }
}

/// Detect project type from files in directory
pub fn detect_project_type(repo_path: &Path) -> ProjectType {
    if repo_path.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if repo_path.join("package.json").exists() {
        ProjectType::Node
    } else if repo_path.join("pyproject.toml").exists()
        || repo_path.join("setup.py").exists()
        || repo_path.join("requirements.txt").exists()
    {
        ProjectType::Python
    } else if repo_path.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// Runs the project's real test command as a subprocess.
pub struct CommandTestRunner {
    repo_path: PathBuf,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(repo_path: &Path, timeout: Duration) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            timeout,
        }
    }

    fn command_for(&self, project: ProjectType, scope: &TestScope) -> Option<(String, Vec<String>)> {
        let subset: Vec<String> = match scope {
            TestScope::Full => Vec::new(),
            TestScope::Subset(ids) => ids.clone(),
        };

        match project {
            ProjectType::Python => {
                let mut args = vec!["-v".to_string(), "--tb=short".to_string()];
                args.extend(subset);
                Some(("pytest".to_string(), args))
            }
            ProjectType::Rust => {
                let mut args = vec!["test".to_string()];
                if !subset.is_empty() {
                    args.push("--".to_string());
                    args.push("--exact".to_string());
                    args.extend(subset);
                }
                Some(("cargo".to_string(), args))
            }
            ProjectType::Go => {
                let mut args = vec!["test".to_string(), "-v".to_string()];
                if subset.is_empty() {
                    args.push("./...".to_string());
                } else {
                    args.push("-run".to_string());
                    args.push(subset.join("|"));
                    args.push("./...".to_string());
                }
                Some(("go".to_string(), args))
            }
            ProjectType::Node => {
                // Subsets depend on the runner; jest and vitest both accept
                // -t name filters.
                if let Ok(pkg_json) = fs::read_to_string(self.repo_path.join("package.json")) {
                    let runner = if pkg_json.contains("vitest") {
                        Some(vec!["vitest".to_string(), "run".to_string()])
                    } else if pkg_json.contains("jest") {
                        Some(vec!["jest".to_string()])
                    } else {
                        None
                    };
                    if let Some(mut args) = runner {
                        for id in &subset {
                            args.push("-t".to_string());
                            args.push(id.clone());
                        }
                        return Some(("npx".to_string(), args));
                    }
                }
                Some(("npm".to_string(), vec!["test".to_string()]))
            }
            ProjectType::Unknown => None,
        }
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, scope: &TestScope) -> Result<TestReport> {
        let project = detect_project_type(&self.repo_path);
        let (cmd, args) = self
            .command_for(project, scope)
            .ok_or_else(|| anyhow::anyhow!("no test runner detected in {}", self.repo_path.display()))?;

        let mut command = Command::new(&cmd);
        command.current_dir(&self.repo_path).args(&args);

        let run = run_command_with_timeout(&mut command, self.timeout)
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let combined = format!("{}\n{}", run.stdout, run.stderr);
        let mut report = match project {
            ProjectType::Python => parse_pytest_output(&combined),
            ProjectType::Rust => parse_cargo_test_output(&combined),
            _ => parse_generic_output(&combined, run.status.map(|s| s.success()).unwrap_or(false)),
        };
        report.timed_out = run.timed_out;
        Ok(report)
    }
}

/// Parse `pytest -v` output into passed ids and structured failures.
pub fn parse_pytest_output(output: &str) -> TestReport {
    let mut report = TestReport::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("FAILED ") {
            let (id, message) = match rest.split_once(" - ") {
                Some((id, msg)) => (id.trim(), msg.trim()),
                None => (rest.trim(), ""),
            };
            report.failed.push(FailingTest {
                id: id.to_string(),
                file: id.split("::").next().map(PathBuf::from),
                message: message.to_string(),
                trace: extract_pytest_trace(output, id),
            });
        } else if trimmed.contains(" PASSED") {
            if let Some(id) = trimmed.split_whitespace().next() {
                report.passed.push(id.to_string());
            }
        }
    }

    report
}

/// Pull the short-traceback section for one failing test out of the full
/// pytest output.
fn extract_pytest_trace(output: &str, test_id: &str) -> String {
    let test_name = test_id.rsplit("::").next().unwrap_or(test_id);
    let marker = format!(" {} ", test_name);

    let mut in_section = false;
    let mut section = Vec::new();
    for line in output.lines() {
        if line.starts_with("___") || line.starts_with("===") {
            if in_section {
                break;
            }
            in_section = line.contains(&marker);
            continue;
        }
        if in_section {
            section.push(line);
        }
    }

    truncate(section.join("\n").trim(), MAX_TRACE_CHARS)
}

/// Parse `cargo test` output.
pub fn parse_cargo_test_output(output: &str) -> TestReport {
    let mut report = TestReport::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("test ") {
            if let Some(name) = rest.strip_suffix(" ... ok") {
                report.passed.push(name.to_string());
            } else if let Some(name) = rest.strip_suffix(" ... FAILED") {
                report.failed.push(FailingTest {
                    id: name.to_string(),
                    file: None,
                    message: String::new(),
                    trace: extract_cargo_trace(output, name),
                });
            }
        }
    }

    report
}

fn extract_cargo_trace(output: &str, test_name: &str) -> String {
    let marker = format!("---- {} stdout ----", test_name);
    let mut in_section = false;
    let mut section = Vec::new();
    for line in output.lines() {
        if line.starts_with("---- ") {
            if in_section {
                break;
            }
            in_section = line == marker;
            continue;
        }
        if in_section {
            if line.starts_with("failures:") {
                break;
            }
            section.push(line);
        }
    }
    truncate(section.join("\n").trim(), MAX_TRACE_CHARS)
}

/// Fallback for runners we don't parse: pass/fail from the exit status.
fn parse_generic_output(output: &str, success: bool) -> TestReport {
    if success {
        TestReport::default()
    } else {
        TestReport {
            passed: Vec::new(),
            failed: vec![FailingTest {
                id: "test-suite".to_string(),
                file: None,
                message: "test command exited non-zero".to_string(),
                trace: truncate(output.trim(), MAX_TRACE_CHARS),
            }],
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_project_types() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_project_type(dir.path()), ProjectType::Unknown);

        fs::write(dir.path().join("pyproject.toml"), "[project]\nname = 'x'\n").unwrap();
        assert_eq!(detect_project_type(dir.path()), ProjectType::Python);

        fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_project_type(dir.path()), ProjectType::Rust);
    }

    #[test]
    fn test_parse_pytest_failures() {
        let output = "\
tests/test_calc.py::test_add PASSED
tests/test_calc.py::test_sub FAILED
=================================== FAILURES ===================================
_________________________________ test_sub _________________________________
    def test_sub():
>       assert sub(3, 1) == 2
E       assert 5 == 2
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_sub - assert 5 == 2
";
        let report = parse_pytest_output(output);
        assert_eq!(report.passed, vec!["tests/test_calc.py::test_add"]);
        assert_eq!(report.failed.len(), 1);
        let failure = &report.failed[0];
        assert_eq!(failure.id, "tests/test_calc.py::test_sub");
        assert_eq!(failure.file.as_deref(), Some(Path::new("tests/test_calc.py")));
        assert_eq!(failure.message, "assert 5 == 2");
        assert!(failure.trace.contains("assert 5 == 2"));
    }

    #[test]
    fn test_parse_cargo_failures() {
        let output = "\
running 2 tests
test calc::tests::test_add ... ok
test calc::tests::test_sub ... FAILED

failures:

---- calc::tests::test_sub stdout ----
thread 'calc::tests::test_sub' panicked at src/calc.rs:10:5:
assertion `left == right` failed

failures:
    calc::tests::test_sub
";
        let report = parse_cargo_test_output(output);
        assert_eq!(report.passed, vec!["calc::tests::test_add"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "calc::tests::test_sub");
        assert!(report.failed[0].trace.contains("panicked"));
    }

    #[test]
    fn test_all_green() {
        let mut report = TestReport::default();
        assert!(report.all_green());
        report.timed_out = true;
        assert!(!report.all_green());
    }

    #[test]
    fn test_subset_command_python() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pyproject.toml"), "[project]\n").unwrap();
        let runner = CommandTestRunner::new(dir.path(), Duration::from_secs(60));
        let scope = TestScope::Subset(vec!["tests/test_a.py::test_x".to_string()]);
        let (cmd, args) = runner.command_for(ProjectType::Python, &scope).unwrap();
        assert_eq!(cmd, "pytest");
        assert!(args.contains(&"tests/test_a.py::test_x".to_string()));
    }
}
