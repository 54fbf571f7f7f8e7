//! Telemetry event sink
//!
//! Append-only JSONL records under `.mend/` in the target repo. Strictly
//! fire-and-forget: a failed write is dropped, never surfaced to the
//! control flow it would otherwise gate.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// The telemetry collaborator seam.
pub trait TelemetrySink {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Discards everything. Useful for tests and `--quiet` runs.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &str, _payload: serde_json::Value) {}
}

/// Appends one JSON object per line to `.mend/events.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    run_id: Uuid,
    file: Mutex<()>,
}

impl JsonlSink {
    pub fn create(repo_path: &Path) -> Self {
        let dir = repo_path.join(".mend");
        let _ = fs::create_dir_all(&dir);
        Self {
            path: dir.join("events.jsonl"),
            run_id: Uuid::new_v4(),
            file: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl TelemetrySink for JsonlSink {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id.to_string(),
            "event": event,
            "payload": payload,
        });

        // Serialize writers within the process; failures are dropped.
        let _guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(file, "{}", record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::create(dir.path());

        sink.emit("iteration_started", json!({"iteration": 1}));
        sink.emit("patch_rejected", json!({"reason": "path denied"}));

        let content = fs::read_to_string(dir.path().join(".mend/events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "iteration_started");
        assert_eq!(first["run_id"], sink.run_id().to_string());
    }

    #[test]
    fn test_null_sink_is_silent() {
        // Just exercising the trait object path.
        let sink: Box<dyn TelemetrySink> = Box::new(NullSink);
        sink.emit("anything", json!({}));
    }
}
