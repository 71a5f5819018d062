//! Failure investigation.
//!
//! Same machinery as `implement` — sandboxed evaluator, tool protocol,
//! agent adapter — but no schema and no `set_result`: the agent explores
//! the context through `eval` and its final free-form text is the answer.
//! Progress is observable as a stream of structured status messages, with
//! the run summary as the last interesting one.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{
    AgentAdapter, AgentMode, AgentRun, AgentTask, StatusMessage, SubprocessAdapter, Summary,
};
use crate::context::{build_descriptors, Context};
use crate::error::ImplementError;
use crate::prompt;
use crate::sandbox::Evaluator;
use crate::tools::{ToolCallback, ToolSurface};
use crate::transcript::{TaskRecord, TranscriptRecorder};

/// Options for one `investigate` request.
#[derive(Default)]
pub struct InvestigateOptions {
    /// External cancellation handle.
    pub cancel: Option<CancellationToken>,

    /// Appended to the rendered prompt.
    pub extra_instructions: Option<String>,

    /// Adapter override; defaults to the subprocess adapter.
    pub adapter: Option<Arc<dyn AgentAdapter>>,
}

/// Handle to a running investigation: the eventual diagnosis plus the
/// status stream.
pub struct Investigation {
    result: oneshot::Receiver<Result<String, ImplementError>>,
    status: mpsc::UnboundedReceiver<StatusMessage>,
}

impl Investigation {
    /// Next status message, `None` once the stream ends.
    pub async fn next_status(&mut self) -> Option<StatusMessage> {
        self.status.recv().await
    }

    /// Drain status messages until the run summary arrives.
    pub async fn summary(&mut self) -> Option<Summary> {
        while let Some(message) = self.status.recv().await {
            if let StatusMessage::Summary(summary) = message {
                return Some(summary);
            }
        }
        None
    }

    /// Await the agent's final diagnosis.
    pub async fn result(self) -> Result<String, ImplementError> {
        self.result
            .await
            .unwrap_or(Err(ImplementError::AgentExit))
    }
}

/// Drive the agent to diagnose the supplied context (typically an error
/// plus whatever state surrounds it).
pub fn investigate(context: Context, options: InvestigateOptions) -> Investigation {
    let (result_tx, result_rx) = oneshot::channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();

    let adapter = options
        .adapter
        .unwrap_or_else(|| Arc::new(SubprocessAdapter::from_env()));
    let cancel = options.cancel.unwrap_or_default();
    let extra_instructions = options.extra_instructions;

    tokio::spawn(async move {
        let outcome = run(context, adapter, cancel, extra_instructions, status_tx).await;
        let _ = result_tx.send(outcome);
    });

    Investigation {
        result: result_rx,
        status: status_rx,
    }
}

async fn run(
    context: Context,
    adapter: Arc<dyn AgentAdapter>,
    cancel: CancellationToken,
    extra_instructions: Option<String>,
    status_tx: mpsc::UnboundedSender<StatusMessage>,
) -> Result<String, ImplementError> {
    let descriptors = build_descriptors(&context);
    let rendered = prompt::render_investigate(&descriptors, extra_instructions.as_deref());

    // Investigations are not cached: there is no (instruction, schema) key
    // to replay under. The transcript still records the run for diagnostics.
    let recorder = TranscriptRecorder::new(
        TaskRecord::new(rendered.clone(), None, descriptors.clone()),
        None,
    );

    let (evaluator, _completion) = Evaluator::new(&context, None, None);
    let callback_recorder = recorder.clone();
    let callback: ToolCallback = Arc::new(move |tool, code, result| {
        callback_recorder.record_call(tool, code, result.clone());
    });
    let surface = Arc::new(ToolSurface::eval_only(evaluator, callback));

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let pump_recorder = recorder.clone();
    let pump = tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            pump_recorder.record_message(message);
        }
    });

    let task = AgentTask {
        mode: AgentMode::Investigate,
        prompt: rendered,
        schema: None,
        context: descriptors,
        tools: surface.definitions(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        pid: std::process::id(),
    };
    let run = AgentRun {
        tools: surface,
        cancel: cancel.clone(),
        messages: message_tx,
        status: status_tx,
    };

    let exit = adapter.run(task, run).await;
    let _ = pump.await;

    if cancel.is_cancelled() {
        return Err(ImplementError::Cancelled);
    }
    match exit {
        Ok(exit) if exit.exit_code == 0 => {
            debug!("investigation finished: {} chars", exit.final_text.len());
            Ok(exit.final_text)
        }
        Ok(exit) => Err(ImplementError::Adapter(anyhow::anyhow!(
            "agent exited with code {}",
            exit.exit_code
        ))),
        Err(e) => Err(ImplementError::Adapter(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::context::{ContextItem, ErrorValue};

    fn error_context() -> Context {
        let mut context = Context::new();
        context.insert(
            "error".to_string(),
            ContextItem::error(
                ErrorValue::new("TimeoutError", "connect timed out").with_stack("at fetch_user"),
            ),
        );
        context
    }

    #[tokio::test]
    async fn investigation_returns_the_agent_final_text() {
        let agent = Arc::new(
            ScriptedAgent::new(vec![("eval", "|| context.error.message")])
                .with_final_text("The connection timed out while fetching the user."),
        );

        let investigation = investigate(
            error_context(),
            InvestigateOptions {
                adapter: Some(agent),
                ..InvestigateOptions::default()
            },
        );
        let text = investigation.result().await.unwrap();
        assert_eq!(text, "The connection timed out while fetching the user.");
    }

    #[tokio::test]
    async fn set_result_is_not_available_to_investigations() {
        let agent = Arc::new(
            ScriptedAgent::new(vec![("set_result", "|| #{ x: 1 }")]).with_final_text("done"),
        );

        let investigation = investigate(
            error_context(),
            InvestigateOptions {
                adapter: Some(agent),
                ..InvestigateOptions::default()
            },
        );
        // The dispatch fails (unknown tool on this surface) but the
        // investigation itself still completes with the final text.
        let text = investigation.result().await.unwrap();
        assert_eq!(text, "done");
    }

    #[tokio::test]
    async fn status_stream_yields_messages_and_the_summary() {
        let summary = Summary {
            turns: 3,
            tool_calls_count: 1,
            ..Summary::default()
        };
        let agent = Arc::new(
            ScriptedAgent::new(vec![("eval", "|| context.error.name")])
                .with_statuses(vec![
                    StatusMessage::Log {
                        message: "inspecting".to_string(),
                        timestamp: None,
                    },
                    StatusMessage::Summary(summary),
                ])
                .with_final_text("diagnosed"),
        );

        let mut investigation = investigate(
            error_context(),
            InvestigateOptions {
                adapter: Some(agent),
                ..InvestigateOptions::default()
            },
        );
        let summary = investigation.summary().await.unwrap();
        assert_eq!(summary.turns, 3);
        assert_eq!(summary.tool_calls_count, 1);
        assert_eq!(investigation.result().await.unwrap(), "diagnosed");
    }

    #[tokio::test]
    async fn cancellation_rejects_the_investigation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let agent =
            Arc::new(ScriptedAgent::new(vec![("eval", "|| 1")]).with_final_text("unreached"));

        let investigation = investigate(
            error_context(),
            InvestigateOptions {
                cancel: Some(cancel),
                adapter: Some(agent),
                ..InvestigateOptions::default()
            },
        );
        let err = investigation.result().await.unwrap_err();
        assert!(matches!(err, ImplementError::Cancelled));
    }
}
