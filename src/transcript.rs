//! Transcript of one request.
//!
//! Every tool call the agent makes is appended as `(tool, code, result)`;
//! opaque agent messages are kept alongside for diagnostic reading. After
//! each call the transcript is written to its cache path best-effort with
//! `success=false`; the orchestrator issues the final write with the
//! authoritative flag. Unknown JSON fields survive a load-then-save cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::context::ContextDescriptor;

/// Result of one tool call, as recorded and persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status")]
pub enum ToolResult {
    #[serde(rename = "ok")]
    Ok { data: Value },
    #[serde(rename = "error")]
    Err {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self::Ok { data }
    }

    pub fn err(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Err {
            message: message.into(),
            stack,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub code: String,
    pub result: ToolResult,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// What the request was: prompt, schema, and context descriptors. Live
/// context values are never recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub context: Vec<ContextDescriptor>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TaskRecord {
    pub fn new(prompt: impl Into<String>, schema: Option<Value>, context: Vec<ContextDescriptor>) -> Self {
        Self {
            prompt: prompt.into(),
            schema,
            context,
            extra: serde_json::Map::new(),
        }
    }
}

/// The full transcript, as persisted to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub success: bool,
    pub task: TaskRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub calls: Vec<ToolCall>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Transcript {
    pub fn new(task: TaskRecord) -> Self {
        Self {
            success: false,
            task,
            messages: Vec::new(),
            calls: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Calls that completed with an `ok` result, in recorded order.
    pub fn ok_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter().filter(|c| c.result.is_ok())
    }

    /// The last successful `set_result`, i.e. the call replay must finish
    /// with.
    pub fn last_ok_set_result(&self) -> Option<&ToolCall> {
        self.calls
            .iter()
            .rev()
            .find(|c| c.tool == "set_result" && c.result.is_ok())
    }
}

/// Shared, append-only recorder for one request.
///
/// Appends are synchronous so ordering follows tool-call order; persistence
/// after each call is fire-and-forget (best-effort by design — a failed
/// write must never fail the request).
#[derive(Clone)]
pub struct TranscriptRecorder {
    inner: Arc<Mutex<Transcript>>,
    path: Option<PathBuf>,
    /// Serializes disk writes. Snapshots are taken while holding this, so a
    /// background write that lands after `finalize` re-writes the finalized
    /// content instead of clobbering the success flag.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TranscriptRecorder {
    pub fn new(task: TaskRecord, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Transcript::new(task))),
            path,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Append one tool call and kick off a best-effort persist.
    pub fn record_call(&self, tool: &str, code: &str, result: ToolResult) {
        if let Ok(mut transcript) = self.inner.lock() {
            transcript.calls.push(ToolCall {
                tool: tool.to_string(),
                code: code.to_string(),
                result,
                extra: serde_json::Map::new(),
            });
        }
        self.persist_in_background();
    }

    /// Append one opaque agent message.
    pub fn record_message(&self, message: Value) {
        if let Ok(mut transcript) = self.inner.lock() {
            transcript.messages.push(message);
        }
    }

    pub fn snapshot(&self) -> Transcript {
        self.inner
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Set the authoritative success flag and write the final transcript.
    pub async fn finalize(&self, success: bool) {
        if let Ok(mut transcript) = self.inner.lock() {
            transcript.success = success;
        }
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot();
        crate::cache::store_transcript(path, &snapshot).await;
    }

    fn persist_in_background(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let recorder = self.clone();
        tokio::spawn(async move {
            let _guard = recorder.write_lock.lock().await;
            let snapshot = recorder.snapshot();
            crate::cache::store_transcript(&path, &snapshot).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_serializes_as_tagged_union() {
        let ok = ToolResult::ok(json!({"result": 10}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "data": {"result": 10}})
        );

        let err = ToolResult::err("boom", Some("at line 1".to_string()));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "message": "boom", "stack": "at line 1"})
        );
    }

    #[test]
    fn error_without_stack_omits_the_field() {
        let err = ToolResult::err("boom", None);
        let value = serde_json::to_value(&err).unwrap();
        assert!(value.get("stack").is_none());
    }

    #[test]
    fn last_ok_set_result_skips_failed_attempts() {
        let mut transcript = Transcript::new(TaskRecord::new("p", None, vec![]));
        transcript.calls = vec![
            ToolCall {
                tool: "set_result".to_string(),
                code: "|| #{ n: -1 }".to_string(),
                result: ToolResult::err("n: must be >= 0", None),
                extra: serde_json::Map::new(),
            },
            ToolCall {
                tool: "set_result".to_string(),
                code: "|| #{ n: 1 }".to_string(),
                result: ToolResult::ok(json!({"n": 1})),
                extra: serde_json::Map::new(),
            },
        ];
        let last = transcript.last_ok_set_result().unwrap();
        assert_eq!(last.code, "|| #{ n: 1 }");
    }

    #[test]
    fn unknown_fields_survive_a_load_then_save_cycle() {
        let raw = json!({
            "success": true,
            "task": {"prompt": "p", "context": [], "futureTaskField": 7},
            "calls": [],
            "futureTopLevelField": {"nested": true},
        });
        let transcript: Transcript = serde_json::from_value(raw).unwrap();
        let saved = serde_json::to_value(&transcript).unwrap();
        assert_eq!(saved["futureTopLevelField"], json!({"nested": true}));
        assert_eq!(saved["task"]["futureTaskField"], json!(7));
    }

    #[test]
    fn recorder_appends_in_order() {
        let recorder = TranscriptRecorder::new(TaskRecord::new("p", None, vec![]), None);
        recorder.record_call("eval", "|| 1", ToolResult::ok(json!({"result": 1})));
        recorder.record_call("eval", "|| 2", ToolResult::ok(json!({"result": 2})));
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.calls.len(), 2);
        assert_eq!(snapshot.calls[0].code, "|| 1");
        assert_eq!(snapshot.calls[1].code, "|| 2");
        assert!(!snapshot.success);
    }
}
