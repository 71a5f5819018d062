//! Opt-in trace logging.
//!
//! When `KLENDATHU_TRACE` is set to `1` or `true`, trace lines are appended
//! to `$HOME/.klendathu/trace.log`. Write-only, best-effort, process-wide;
//! failures are swallowed so tracing can never break a request.

use std::io::Write;
use std::path::PathBuf;

use crate::config;

fn trace_file() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".klendathu").join("trace.log"))
}

/// Append one line to the trace log, if tracing is enabled.
pub fn trace_log(message: &str) {
    if !config::trace_enabled() {
        return;
    }
    let Some(path) = trace_file() else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let line = format!("[{}] {}\n", chrono::Utc::now().to_rfc3339(), message);
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
}
