//! Mend library crate
//!
//! Exposes the repair loop and its collaborators so integration tests and
//! external tooling can drive them without going through CLI startup.

pub mod agent;
pub mod config;
pub mod error;
pub mod guard;
pub mod llm;
pub mod patch;
pub mod prompt;
pub mod resolver;
pub mod syntax;
pub mod telemetry;
pub mod testing;
pub mod util;
pub mod vcs;
