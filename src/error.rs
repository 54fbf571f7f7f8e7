//! Error taxonomy for the repair pipeline
//!
//! Format, safety, apply, and syntax failures are recovered locally: they
//! become reflection context for the next planning attempt. Only timeout,
//! iteration exhaustion, and repeated LLM failure end the run.

use thiserror::Error;

/// A policy violation caught before a patch is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("patch touches denied path '{path}' (pattern: {pattern})")]
    PathDenied { path: String, pattern: String },

    #[error("patch changes {actual} lines, limit is {limit}")]
    SizeExceeded { actual: usize, limit: usize },

    #[error("patch touches {actual} files, limit is {limit}")]
    TooManyFiles { actual: usize, limit: usize },

    #[error("patch adds '{symbol}' in {path} without removing the existing definition")]
    DuplicateDefinition { path: String, symbol: String },

    #[error("patch edits test file '{path}'")]
    TestFileEdit { path: String },
}

/// Why a generated patch was rejected during one iteration.
///
/// Every variant carries a human-readable reason that is forwarded to both
/// telemetry and the next planning prompt.
#[derive(Debug, Clone, Error)]
pub enum PatchRejection {
    #[error("patch is unparseable: {0}")]
    Format(String),

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error("patch could not be applied: {0}")]
    Apply(String),

    #[error("syntax validation failed: {0}")]
    Syntax(String),

    #[error("regression detected: {0} previously-passing test(s) now fail")]
    Regression(usize),

    #[error("critic rejected patch: {0}")]
    Critic(String),
}

/// Failure modes of the LLM collaborator.
///
/// `Transient` and `Malformed` feed the reflect step; `Auth` is not
/// retryable and ends the run.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("transient LLM failure: {0}")]
    Transient(String),

    #[error("LLM returned unusable output: {0}")]
    Malformed(String),

    #[error("LLM authentication failed: {0}")]
    Auth(String),
}
