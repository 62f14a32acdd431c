// Trace recorder - batched JSONL audit logging with rotation and retention

use crate::core::models::{TraceRecord, Verdict};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{error, warn};

/// Rotation policy for trace files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// New file when the current one reaches `max_file_size`
    Size,
    /// Keep appending to one file
    None,
}

/// Configuration for [`TraceRecorder`].
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub privacy_mode: bool,
    pub rotation: RotationMode,
    pub max_file_size: u64,
    pub retention_days: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./traces/"),
            batch_size: 100,
            privacy_mode: false,
            rotation: RotationMode::Size,
            max_file_size: 100 * 1024 * 1024,
            retention_days: 30,
        }
    }
}

/// Compute a SHA-256 hash of arguments for privacy mode.
/// JSON maps are canonicalized (sorted keys) before hashing.
pub fn compute_args_hash(args: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    let serialized = canonicalize(args).to_string();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

struct RecorderState {
    buffer: Vec<TraceRecord>,
    file_path: PathBuf,
    current_size: u64,
    record_count: u64,
}

/// Records audit logs in JSONL format.
///
/// Records are buffered up to `batch_size` and flushed atomically.
/// Write failures never block a check; buffered records are dropped
/// with an error log.
pub struct TraceRecorder {
    config: TraceConfig,
    state: Mutex<RecorderState>,
}

fn trace_file_path(dir: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("trace_{}.jsonl", stamp))
}

impl TraceRecorder {
    pub fn new(config: TraceConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        let file_path = trace_file_path(&config.output_dir);
        Ok(Self {
            state: Mutex::new(RecorderState {
                buffer: Vec::new(),
                file_path,
                current_size: 0,
                record_count: 0,
            }),
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a trace record to the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        session_id: &str,
        tool: &str,
        verdict: Verdict,
        rule_id: Option<&str>,
        pii_types: Vec<String>,
        latency_ms: f64,
        args: Option<&Value>,
        approval: Option<Value>,
    ) {
        let (args_field, args_hash) = match args {
            Some(args) if self.config.privacy_mode => (None, Some(compute_args_hash(args))),
            Some(args) => (Some(args.clone()), None),
            None => (None, None),
        };

        let record = TraceRecord {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            verdict,
            rule_id: rule_id.map(|s| s.to_string()),
            pii_types,
            latency_ms: (latency_ms * 100.0).round() / 100.0,
            args: args_field,
            args_hash,
            approval,
        };

        let mut state = self.lock();
        state.buffer.push(record);
        state.record_count += 1;
        if state.buffer.len() >= self.config.batch_size {
            self.flush_locked(&mut state);
        }
    }

    /// Write buffered records to the trace file.
    pub fn flush(&self) {
        let mut state = self.lock();
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut RecorderState) {
        if state.buffer.is_empty() {
            return;
        }

        let mut lines = Vec::new();
        for record in &state.buffer {
            match serde_json::to_string(record) {
                Ok(line) => lines.push(line),
                Err(e) => warn!(error = %e, "Failed to serialize trace record"),
            }
        }
        let payload = lines.join("\n") + "\n";

        if self.config.rotation == RotationMode::Size
            && state.current_size >= self.config.max_file_size
        {
            state.file_path = trace_file_path(&self.config.output_dir);
            state.current_size = 0;
        }

        match Self::append(&state.file_path, payload.as_bytes()) {
            Ok(()) => state.current_size += payload.len() as u64,
            Err(e) => error!(
                path = %state.file_path.display(),
                error = %e,
                dropped = state.buffer.len(),
                "Failed to write trace file; dropping buffered records"
            ),
        }
        state.buffer.clear();
    }

    fn append(path: &Path, payload: &[u8]) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(payload)?;
        file.flush()
    }

    /// Remove trace files older than `retention_days`.
    /// Returns the number of removed files.
    pub fn sweep_retention(&self) -> usize {
        let horizon = Duration::from_secs(u64::from(self.config.retention_days) * 86_400);
        let cutoff = SystemTime::now().checked_sub(horizon);
        let Some(cutoff) = cutoff else { return 0 };

        let entries = match fs::read_dir(&self.config.output_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list trace directory for retention sweep");
                return 0;
            }
        };

        let mut removed = 0;
        let current = self.lock().file_path.clone();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("trace_") || !name.ends_with(".jsonl") || path == current {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Total records recorded (including still-buffered).
    pub fn record_count(&self) -> u64 {
        self.lock().record_count
    }

    /// The current trace file path.
    pub fn file_path(&self) -> PathBuf {
        self.lock().file_path.clone()
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        self.flush();
    }
}
