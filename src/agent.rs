//! Agent adapters.
//!
//! The orchestrator is agnostic about how the agent runs; it hands an
//! adapter the rendered prompt plus tool handles and expects every tool
//! invocation the agent makes to reach the [`ToolSurface`] exactly once, in
//! order. The bundled [`SubprocessAdapter`] drives an external CLI over an
//! NDJSON stdio protocol: one JSON job object in on stdin, events out on
//! stdout, structured status messages on stderr.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ContextDescriptor;
use crate::tools::{ToolDefinition, ToolSurface};

/// Which of the two request kinds the agent is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Implement,
    Investigate,
}

/// The job handed to an adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AgentTask {
    pub mode: AgentMode,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    pub context: Vec<ContextDescriptor>,
    pub tools: Vec<ToolDefinition>,
    pub timestamp: String,
    pub pid: u32,
}

/// Channels and handles the adapter reports through while running.
pub struct AgentRun {
    /// Tool dispatch for the agent's `eval`/`set_result`/`bail` calls.
    pub tools: Arc<ToolSurface>,
    /// Cooperative stop signal; the adapter must wind down when it fires.
    pub cancel: CancellationToken,
    /// Opaque agent messages, recorded in the transcript for diagnostics.
    pub messages: mpsc::UnboundedSender<Value>,
    /// Structured progress messages (investigate mode surfaces these).
    pub status: mpsc::UnboundedSender<StatusMessage>,
}

/// How the agent finished. Exit code 0 means the agent believes it
/// succeeded; the orchestrator still treats the completion promise as the
/// source of truth.
#[derive(Debug, Clone)]
pub struct AgentExit {
    pub exit_code: i32,
    /// Final free-form text (the investigate-mode answer).
    pub final_text: String,
}

/// Drives one agent run. Implementations must issue tool calls strictly
/// sequentially, each awaited to completion before the next.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn run(&self, task: AgentTask, run: AgentRun) -> Result<AgentExit>;
}

// ── Status messages ───────────────────────────────────────────────

/// Structured progress messages streamed by the agent process on stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Log {
        message: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ServerStarted {
        url: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Turn {
        #[serde(rename = "turnNumber", default)]
        turn_number: u32,
        #[serde(rename = "stopReason", default)]
        stop_reason: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolCall {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolResult {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "resultPreview", default)]
        result_preview: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Summary(Summary),
}

/// Final run statistics, reported once at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Summary {
    pub turns: u32,
    pub cost: f64,
    pub finish_reason: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub tool_calls_count: u64,
    pub warnings: Vec<String>,
    pub timestamp: Option<String>,
}

// ── Subprocess adapter ────────────────────────────────────────────

/// NDJSON events emitted by the agent CLI on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    /// The agent invokes a tool; the adapter answers on stdin with a
    /// `tool_result` line carrying the same `id`.
    ToolCall {
        id: String,
        tool: String,
        #[serde(default)]
        input: String,
    },
    /// Opaque message for the transcript.
    Message {
        #[serde(flatten)]
        payload: Value,
    },
    /// Final free-form text (investigate mode).
    Final { text: String },
    #[serde(other)]
    Unknown,
}

/// Adapter that spawns an agent CLI (`KLENDATHU_AGENT_CMD`, default
/// `klendathu-agent`) and bridges its stdio streams to the tool surface.
pub struct SubprocessAdapter {
    command: String,
}

impl SubprocessAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::config::Config::from_env().agent_cmd)
    }
}

#[async_trait]
impl AgentAdapter for SubprocessAdapter {
    async fn run(&self, task: AgentTask, run: AgentRun) -> Result<AgentExit> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("agent command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning agent CLI: {}", self.command);
        let mut child = cmd.spawn().map_err(|e| {
            anyhow!(
                "failed to spawn agent CLI '{}': {}. Is it installed?",
                self.command,
                e
            )
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture agent stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture agent stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture agent stderr"))?;

        // The whole job goes down as one JSON line.
        let mut job = serde_json::to_string(&task)?;
        job.push('\n');
        stdin.write_all(job.as_bytes()).await?;
        stdin.flush().await?;

        // Status messages arrive as NDJSON on stderr; malformed lines are
        // progress noise and are skipped.
        let status_tx = run.status.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StatusMessage>(line) {
                    Ok(message) => {
                        let _ = status_tx.send(message);
                    }
                    Err(_) => debug!("agent stderr: {}", line),
                }
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut final_text = String::new();

        loop {
            let line = tokio::select! {
                _ = run.cancel.cancelled() => {
                    debug!("cancellation requested, killing agent CLI");
                    let _ = child.kill().await;
                    return Ok(AgentExit { exit_code: -1, final_text });
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break; // EOF
            };
            if line.trim().is_empty() {
                continue;
            }

            let event = match serde_json::from_str::<AgentEvent>(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("unparseable agent event: {} - line: {}", e, line);
                    continue;
                }
            };

            match event {
                AgentEvent::ToolCall { id, tool, input } => {
                    // Sequential by construction: the next stdout line is
                    // not read until this response is written.
                    let response = run.tools.dispatch(&tool, &input).await;
                    let reply = serde_json::json!({
                        "type": "tool_result",
                        "id": id,
                        "text": response.text,
                        "is_error": response.is_error,
                    });
                    let mut reply = reply.to_string();
                    reply.push('\n');
                    stdin.write_all(reply.as_bytes()).await?;
                    stdin.flush().await?;
                }
                AgentEvent::Message { payload } => {
                    let _ = run.messages.send(payload);
                }
                AgentEvent::Final { text } => {
                    final_text = text;
                }
                AgentEvent::Unknown => {}
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!("agent CLI exited with code {}", exit_code);
        }
        Ok(AgentExit {
            exit_code,
            final_text,
        })
    }
}

// ── Test adapter ──────────────────────────────────────────────────
