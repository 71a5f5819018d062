//! Replay of cached transcripts.
//!
//! Sequential idiom: each recorded `eval` is re-executed in order against a
//! fresh evaluator, then the last successful `set_result` runs through the
//! normal validation path. Any step that diverges from its recorded `ok`
//! outcome — a throw, an error-shaped value, a validation failure — aborts
//! with a mismatch, and the orchestrator silently falls back to a live run.

use serde_json::Value;

use crate::sandbox::{is_error_shaped, Evaluator};
use crate::transcript::Transcript;

/// A recorded `ok` call diverged during replay. Internal: the caller never
/// sees this — it only triggers the fallback to live execution.
#[derive(Debug, thiserror::Error)]
#[error("replay mismatch in {tool}: {reason}")]
pub struct ReplayMismatch {
    pub tool: String,
    pub reason: String,
}

impl ReplayMismatch {
    fn new(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Re-execute a cached transcript against a fresh evaluator. On success the
/// evaluator's completion promise has been resolved with the returned value,
/// exactly as in a live run.
pub async fn replay(
    transcript: &Transcript,
    evaluator: &mut Evaluator,
) -> Result<Value, ReplayMismatch> {
    for call in transcript.ok_calls() {
        if call.tool != "eval" {
            continue;
        }
        let output = evaluator
            .eval(&call.code)
            .await
            .map_err(|err| ReplayMismatch::new("eval", err.message()))?;
        if is_error_shaped(&output.result) {
            return Err(ReplayMismatch::new(
                "eval",
                "recorded ok produced an error value",
            ));
        }
    }

    let final_call = transcript
        .last_ok_set_result()
        .ok_or_else(|| ReplayMismatch::new("set_result", "no successful set_result recorded"))?;

    let value = evaluator
        .set_result(&final_call.code)
        .await
        .map_err(|err| ReplayMismatch::new("set_result", err.message()))?;
    if is_error_shaped(&value) {
        return Err(ReplayMismatch::new(
            "set_result",
            "recorded ok produced an error value",
        ));
    }
    Ok(value)
}
