//! Repair orchestrator
//!
//! Drives Plan -> Generate -> Review -> Apply -> Test -> Reflect cycles
//! under an iteration budget and a wall-clock deadline. Each iteration is
//! atomic: its patch ends as exactly one version-control commit, or the
//! working tree is restored bit-for-bit (verified by content hash).
//!
//! Components return values; only the orchestrator mutates `AgentState`.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::error::{LlmError, PatchRejection};
use crate::guard::{self, ReviewDecision};
use crate::llm::{CompletionProvider, CompletionRequest};
use crate::patch::apply::ApplyEngine;
use crate::patch::fixer::{reconstruct_edit, validate_and_fix, FixOutcome};
use crate::patch::Patch;
use crate::prompt::{self, SourceContext};
use crate::resolver;
use crate::telemetry::TelemetrySink;
use crate::testing::{FailingTest, TestReport, TestRunner, TestScope};
use crate::util::truncate;
use crate::vcs::{worktree_hash, Vcs};

/// Transient LLM failures are retried this many times with backoff before
/// the run ends in `FatalError`.
const LLM_RETRIES: u32 = 3;
const LLM_RETRY_BACKOFF_SECS: u64 = 1;

/// The same rejection reason this many times in a row means the loop is
/// stuck; stop instead of burning budget.
const REPEATED_REJECTION_LIMIT: usize = 3;

/// Source files embedded in prompts, at most.
const MAX_CONTEXT_FILES: usize = 3;

const PLAN_MAX_TOKENS: u32 = 1024;
const PATCH_MAX_TOKENS: u32 = 4096;
const CRITIC_MAX_TOKENS: u32 = 512;

/// The phase the state machine is in, for telemetry and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPhase {
    Planning,
    GeneratingPatch,
    Reviewing,
    Applying,
    Testing,
    Reflecting,
}

impl RepairPhase {
    pub fn status_text(&self) -> &'static str {
        match self {
            RepairPhase::Planning => "Planning...",
            RepairPhase::GeneratingPatch => "Generating patch...",
            RepairPhase::Reviewing => "Reviewing patch",
            RepairPhase::Applying => "Applying patch",
            RepairPhase::Testing => "Running tests...",
            RepairPhase::Reflecting => "Reflecting",
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    Timeout,
    MaxIterationsReached,
    SafetyViolation,
    FatalError,
}

/// Run state, created at run start and owned exclusively by the
/// orchestrator. Other components never mutate it.
#[derive(Debug)]
pub struct AgentState {
    pub iteration: usize,
    pub max_iterations: usize,
    pub start_time: Instant,
    pub timeout: Duration,
    pub failing_tests: Vec<FailingTest>,
    /// Commit ids of patches kept so far
    pub patches_applied: Vec<String>,
    pub final_status: Option<RunStatus>,
}

impl AgentState {
    fn new(max_iterations: usize, timeout: Duration) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            start_time: Instant::now(),
            timeout,
            failing_tests: Vec::new(),
            patches_applied: Vec::new(),
            final_status: None,
        }
    }

    /// Budget check, run between every phase transition.
    fn over_budget(&self) -> Option<RunStatus> {
        if self.start_time.elapsed() >= self.timeout {
            Some(RunStatus::Timeout)
        } else if self.iteration >= self.max_iterations {
            Some(RunStatus::MaxIterationsReached)
        } else {
            None
        }
    }
}

/// The only output this core produces; formatting it is the CLI's job.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub iterations_used: usize,
    pub patches_applied: Vec<String>,
    pub remaining_failures: Vec<FailingTest>,
}

/// What one iteration did to the working tree.
enum IterationOutcome {
    /// Rejected before apply, or the LLM output was unusable; tree untouched.
    Rejected(String),
    /// Applied, then a post-check failed; tree restored.
    RolledBack(String),
    /// Applied and committed.
    Committed(String),
}

pub struct RepairAgent<'a, L, T, V, S>
where
    L: CompletionProvider,
    T: TestRunner,
    V: Vcs,
    S: TelemetrySink,
{
    repo_root: PathBuf,
    config: &'a Config,
    llm: &'a L,
    runner: &'a T,
    vcs: &'a V,
    sink: &'a S,
}

impl<'a, L, T, V, S> RepairAgent<'a, L, T, V, S>
where
    L: CompletionProvider,
    T: TestRunner,
    V: Vcs,
    S: TelemetrySink,
{
    pub fn new(
        repo_root: &Path,
        config: &'a Config,
        llm: &'a L,
        runner: &'a T,
        vcs: &'a V,
        sink: &'a S,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            config,
            llm,
            runner,
            vcs,
            sink,
        }
    }

    /// Run the repair loop to a terminal state.
    pub fn run(&self) -> RunResult {
        let mut state = AgentState::new(
            self.config.max_iterations,
            Duration::from_secs(self.config.timeout_secs),
        );
        self.sink.emit(
            "run_started",
            json!({
                "max_iterations": state.max_iterations,
                "timeout_secs": self.config.timeout_secs,
            }),
        );

        // Establish the baseline failing set.
        let initial = match self.runner.run(&TestScope::Full) {
            Ok(report) => report,
            Err(e) => {
                self.sink.emit("fatal", json!({"reason": e.to_string()}));
                return self.finish(state, RunStatus::FatalError);
            }
        };
        if initial.all_green() {
            return self.finish(state, RunStatus::Success);
        }
        state.failing_tests = initial.failed.clone();
        let mut passing: Vec<String> = initial.passed.clone();

        let mut feedback: Option<String> = None;
        let mut last_rejection: Option<String> = None;
        let mut rejection_streak = 0usize;

        loop {
            if let Some(status) = state.over_budget() {
                return self.finish(state, status);
            }
            state.iteration += 1;
            self.sink.emit(
                "iteration_started",
                json!({
                    "iteration": state.iteration,
                    "failing": state.failing_tests.len(),
                }),
            );

            let outcome = match self.run_iteration(&mut state, &passing, feedback.take()) {
                Ok(outcome) => outcome,
                Err(status) => return self.finish(state, status),
            };

            // Track repeated identical rejections across iterations.
            let rejection_reason = match &outcome {
                IterationOutcome::Rejected(reason) | IterationOutcome::RolledBack(reason) => {
                    Some(reason.clone())
                }
                IterationOutcome::Committed(_) => None,
            };
            match &rejection_reason {
                Some(reason) => {
                    if last_rejection.as_deref() == Some(reason.as_str()) {
                        rejection_streak += 1;
                    } else {
                        rejection_streak = 1;
                        last_rejection = Some(reason.clone());
                    }
                    if rejection_streak >= REPEATED_REJECTION_LIMIT {
                        self.sink.emit(
                            "stuck",
                            json!({"reason": reason, "streak": rejection_streak}),
                        );
                        return self.finish(state, RunStatus::SafetyViolation);
                    }
                }
                None => {
                    last_rejection = None;
                    rejection_streak = 0;
                }
            }

            match outcome {
                IterationOutcome::Rejected(reason) | IterationOutcome::RolledBack(reason) => {
                    // Reflect: the reason becomes planning context.
                    feedback = Some(reason);
                    continue;
                }
                IterationOutcome::Committed(commit_id) => {
                    state.patches_applied.push(commit_id);
                }
            }

            if let Some(status) = state.over_budget() {
                return self.finish(state, status);
            }

            // Test: the committed patch faces the full suite.
            self.sink.emit("phase", json!({"phase": RepairPhase::Testing.status_text()}));
            let report = match self.runner.run(&TestScope::Full) {
                Ok(report) => report,
                Err(e) => {
                    self.sink.emit("fatal", json!({"reason": e.to_string()}));
                    return self.finish(state, RunStatus::FatalError);
                }
            };

            // Reflect
            self.sink.emit("phase", json!({"phase": RepairPhase::Reflecting.status_text()}));
            if report.all_green() {
                state.failing_tests.clear();
                return self.finish(state, RunStatus::Success);
            }

            feedback = Some(reflect_feedback(&state.failing_tests, &report));
            state.failing_tests = report.failed;
            passing = report.passed;
        }
    }

    /// One Plan -> Generate -> Review -> Apply cycle. Returns the tree
    /// outcome, or a terminal status for unrecoverable faults.
    fn run_iteration(
        &self,
        state: &mut AgentState,
        passing: &[String],
        feedback: Option<String>,
    ) -> std::result::Result<IterationOutcome, RunStatus> {
        let sources = self.gather_sources(&state.failing_tests);

        // Plan
        self.sink.emit("phase", json!({"phase": RepairPhase::Planning.status_text()}));
        let plan = match self.complete_with_retry(&CompletionRequest {
            system: prompt::plan_system(),
            user: prompt::build_plan_prompt(&state.failing_tests, &sources, feedback.as_deref()),
            max_tokens: PLAN_MAX_TOKENS,
            model: self.config.model,
        }) {
            Ok(plan) => plan,
            Err(outcome) => return outcome,
        };
        if let Some(status) = state.over_budget() {
            return Err(status);
        }

        // Generate
        self.sink
            .emit("phase", json!({"phase": RepairPhase::GeneratingPatch.status_text()}));
        let response = match self.complete_with_retry(&CompletionRequest {
            system: prompt::patch_system(),
            user: prompt::build_patch_prompt(&plan, &state.failing_tests, &sources),
            max_tokens: PATCH_MAX_TOKENS,
            model: self.config.model,
        }) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if let Some(status) = state.over_budget() {
            return Err(status);
        }

        // Validate and fix
        let diff_text = prompt::extract_diff(&response);
        let patch = match validate_and_fix(&diff_text) {
            FixOutcome::Clean(patch) => patch,
            FixOutcome::Truncated(patch) => {
                self.sink.emit("patch_truncated", json!({}));
                match self.reconstruct_patch(&patch) {
                    Some(rebuilt) => rebuilt,
                    None => {
                        let reason = PatchRejection::Format(
                            "truncated tail could not be reconstructed against current file content"
                                .to_string(),
                        )
                        .to_string();
                        self.reject(&reason);
                        return Ok(IterationOutcome::Rejected(reason));
                    }
                }
            }
            FixOutcome::Unparseable(detail) => {
                let reason = PatchRejection::Format(detail).to_string();
                self.reject(&reason);
                return Ok(IterationOutcome::Rejected(reason));
            }
        };

        // Review: guard preflight first, optional critic second. A
        // rejection here means the application engine is never invoked.
        self.sink.emit("phase", json!({"phase": RepairPhase::Reviewing.status_text()}));
        if let Err(violation) = guard::preflight(&patch, &self.repo_root, &self.config.safety) {
            let reason = PatchRejection::Safety(violation).to_string();
            self.reject(&reason);
            return Ok(IterationOutcome::Rejected(reason));
        }
        if self.config.critic_enabled {
            match self.critic_review(&patch, &state.failing_tests) {
                Ok(ReviewDecision::Rejected { reason }) => {
                    let reason = PatchRejection::Critic(reason).to_string();
                    self.reject(&reason);
                    return Ok(IterationOutcome::Rejected(reason));
                }
                Ok(ReviewDecision::Approved) => {}
                Err(outcome) => return outcome,
            }
        }
        if let Some(status) = state.over_budget() {
            return Err(status);
        }

        // Apply, run the post-apply checks, then commit or restore.
        self.apply_and_verify(state, passing, &patch)
    }

    /// Tiered apply plus post-apply checks, with verified rollback on any
    /// failure after the tree has been touched.
    fn apply_and_verify(
        &self,
        state: &AgentState,
        passing: &[String],
        patch: &Patch,
    ) -> std::result::Result<IterationOutcome, RunStatus> {
        let pre_head = match self.vcs.current_head() {
            Ok(head) => head,
            Err(e) => {
                self.sink.emit("fatal", json!({"reason": e.to_string()}));
                return Err(RunStatus::FatalError);
            }
        };
        let pre_hash = match worktree_hash(&self.repo_root) {
            Ok(hash) => hash,
            Err(e) => {
                self.sink.emit("fatal", json!({"reason": e.to_string()}));
                return Err(RunStatus::FatalError);
            }
        };

        self.sink.emit("phase", json!({"phase": RepairPhase::Applying.status_text()}));
        let source_roots = resolver::discover_source_roots(&self.repo_root);
        let engine = ApplyEngine::new(&self.repo_root, &source_roots);

        let outcome = match engine.apply(patch) {
            Ok(outcome) => outcome,
            Err(failure) => {
                // No tier touched the tree.
                let reason = PatchRejection::Apply(failure.to_string()).to_string();
                self.reject(&reason);
                return Ok(IterationOutcome::Rejected(reason));
            }
        };

        if outcome.changed_files.is_empty() {
            let reason = "patch applied but changed nothing".to_string();
            self.reject(&reason);
            return Ok(IterationOutcome::Rejected(reason));
        }

        // Post-apply: every changed file must still parse.
        if let Err(detail) = guard::check_syntax(&self.repo_root, &outcome.changed_files) {
            let reason = PatchRejection::Syntax(detail).to_string();
            self.rollback(&pre_head, &pre_hash)?;
            self.reject(&reason);
            return Ok(IterationOutcome::RolledBack(reason));
        }

        // Post-apply: previously passing tests must still pass.
        if self.config.safety.regression_check {
            let baseline: Vec<String> = passing.to_vec();
            if !baseline.is_empty() {
                let report = match self.runner.run(&TestScope::Subset(baseline)) {
                    Ok(report) => report,
                    Err(e) => {
                        self.rollback(&pre_head, &pre_hash)?;
                        self.sink.emit("fatal", json!({"reason": e.to_string()}));
                        return Err(RunStatus::FatalError);
                    }
                };
                let original: Vec<&str> =
                    state.failing_tests.iter().map(|t| t.id.as_str()).collect();
                let regressions: Vec<&FailingTest> = report
                    .failed
                    .iter()
                    .filter(|t| !original.contains(&t.id.as_str()))
                    .collect();
                if !regressions.is_empty() {
                    let reason = format!(
                        "{} ({})",
                        PatchRejection::Regression(regressions.len()),
                        regressions
                            .iter()
                            .map(|t| t.id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    self.rollback(&pre_head, &pre_hash)?;
                    self.reject(&reason);
                    return Ok(IterationOutcome::RolledBack(reason));
                }
            }
        }

        // Commit the surviving patch as this iteration's single commit.
        let message = format!(
            "mend: iteration {} ({} file(s) changed)",
            state.iteration,
            outcome.changed_files.len()
        );
        match self.vcs.commit_all(&message) {
            Ok(commit_id) => {
                self.sink.emit(
                    "patch_committed",
                    json!({
                        "commit": commit_id,
                        "files": outcome
                            .changed_files
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>(),
                    }),
                );
                Ok(IterationOutcome::Committed(commit_id))
            }
            Err(e) => {
                self.sink.emit("fatal", json!({"reason": e.to_string()}));
                self.rollback(&pre_head, &pre_hash)?;
                Err(RunStatus::FatalError)
            }
        }
    }

    /// Restore the pre-iteration tree and verify the restoration by hash.
    fn rollback(&self, pre_head: &str, pre_hash: &str) -> std::result::Result<(), RunStatus> {
        if let Err(e) = self.vcs.reset_hard(pre_head) {
            self.sink
                .emit("fatal", json!({"reason": format!("rollback failed: {}", e)}));
            return Err(RunStatus::FatalError);
        }
        match worktree_hash(&self.repo_root) {
            Ok(hash) if hash == pre_hash => {
                self.sink.emit("rolled_back", json!({"verified": true}));
                Ok(())
            }
            Ok(_) => {
                self.sink.emit(
                    "fatal",
                    json!({"reason": "rollback left the tree in a different state"}),
                );
                Err(RunStatus::FatalError)
            }
            Err(e) => {
                self.sink.emit("fatal", json!({"reason": e.to_string()}));
                Err(RunStatus::FatalError)
            }
        }
    }

    /// LLM call with bounded retry for transient failures. Malformed
    /// output and exhausted retries become iteration feedback; auth
    /// failures end the run.
    fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, std::result::Result<IterationOutcome, RunStatus>> {
        let mut attempt = 0;
        loop {
            match self.llm.complete(request) {
                Ok(text) => return Ok(text),
                Err(LlmError::Auth(detail)) => {
                    self.sink.emit("fatal", json!({"reason": detail}));
                    return Err(Err(RunStatus::FatalError));
                }
                Err(LlmError::Malformed(detail)) => {
                    let reason = format!("LLM output unusable: {}", detail);
                    self.reject(&reason);
                    return Err(Ok(IterationOutcome::Rejected(reason)));
                }
                Err(LlmError::Transient(detail)) => {
                    attempt += 1;
                    if attempt > LLM_RETRIES {
                        self.sink.emit(
                            "fatal",
                            json!({"reason": format!("LLM unavailable after {} retries: {}", LLM_RETRIES, detail)}),
                        );
                        return Err(Err(RunStatus::FatalError));
                    }
                    thread::sleep(Duration::from_secs(
                        LLM_RETRY_BACKOFF_SECS << (attempt - 1),
                    ));
                }
            }
        }
    }

    fn critic_review(
        &self,
        patch: &Patch,
        failing: &[FailingTest],
    ) -> std::result::Result<ReviewDecision, std::result::Result<IterationOutcome, RunStatus>> {
        let response = self.complete_with_retry(&CompletionRequest {
            system: prompt::critic_system(),
            user: prompt::build_critic_prompt(&patch.raw, failing),
            max_tokens: CRITIC_MAX_TOKENS,
            model: crate::llm::Model::DeepSeek,
        })?;
        Ok(prompt::parse_critic_verdict(&response))
    }

    /// Resolve the failing tests' imports into prompt context.
    fn gather_sources(&self, failing: &[FailingTest]) -> SourceContext {
        let mut sources: SourceContext = Vec::new();
        for test in failing {
            let Some(file) = &test.file else { continue };
            for candidate in resolver::resolve_test_sources(&self.repo_root, file) {
                if sources.len() >= MAX_CONTEXT_FILES {
                    return sources;
                }
                if sources.iter().any(|(p, _)| p == &candidate) {
                    continue;
                }
                if let Ok(content) = fs::read_to_string(self.repo_root.join(&candidate)) {
                    sources.push((candidate, content));
                }
            }
        }
        sources
    }

    /// Rebuild a truncated patch's edits against live file content.
    fn reconstruct_patch(&self, patch: &Patch) -> Option<Patch> {
        let mut edits = Vec::new();
        for edit in &patch.edits {
            let current = fs::read_to_string(self.repo_root.join(edit.target_path())).ok()?;
            edits.push(reconstruct_edit(&current, edit)?);
        }
        Some(Patch {
            raw: patch.raw.clone(),
            edits,
        })
    }

    fn reject(&self, reason: &str) {
        self.sink
            .emit("patch_rejected", json!({"reason": truncate(reason, 500)}));
    }

    fn finish(&self, mut state: AgentState, status: RunStatus) -> RunResult {
        state.final_status = Some(status);
        self.sink.emit(
            "run_finished",
            json!({
                "status": format!("{:?}", status),
                "iterations": state.iteration,
                "patches": state.patches_applied.len(),
                "remaining_failures": state.failing_tests.len(),
            }),
        );
        RunResult {
            status,
            iterations_used: state.iteration,
            patches_applied: state.patches_applied,
            remaining_failures: state.failing_tests,
        }
    }
}

/// Compare the failing sets before and after the iteration's patch.
fn reflect_feedback(before: &[FailingTest], after: &TestReport) -> String {
    let before_ids: Vec<&str> = before.iter().map(|t| t.id.as_str()).collect();
    let after_ids: Vec<&str> = after.failed.iter().map(|t| t.id.as_str()).collect();

    let fixed = before_ids.iter().filter(|id| !after_ids.contains(id)).count();
    let remaining = after_ids.join(", ");

    if fixed > 0 {
        format!(
            "previous patch fixed {} test(s); still failing: {}",
            fixed, remaining
        )
    } else {
        format!(
            "previous patch was committed but fixed nothing; still failing: {}",
            remaining
        )
    }
}
