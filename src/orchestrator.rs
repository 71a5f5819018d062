//! Request lifecycle for `implement`.
//!
//! One call, one state machine: build the context descriptors and cache
//! key, consult the cache, replay on a hit, otherwise run the agent live
//! against a fresh evaluator, and settle the caller's future from the
//! completion promise. The final transcript write carries the
//! authoritative success flag; the per-tool-call writes are best-effort.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentAdapter, AgentMode, AgentRun, AgentTask, SubprocessAdapter};
use crate::cache;
use crate::config::{CacheMode, Config};
use crate::context::{build_descriptors, Context};
use crate::error::ImplementError;
use crate::prompt;
use crate::replay;
use crate::sandbox::{Evaluator, ResultValidator};
use crate::schema::Schema;
use crate::tools::{ToolCallback, ToolSurface};
use crate::trace;
use crate::transcript::{TaskRecord, TranscriptRecorder};

/// Options for one `implement` request.
#[derive(Default)]
pub struct ImplementOptions {
    /// External cancellation handle. On signal the agent is stopped and the
    /// caller sees a cancellation failure.
    pub cancel: Option<CancellationToken>,

    /// Extra validation applied to the result after schema validation. A
    /// rejection is returned to the agent as a retryable error.
    pub validate: Option<ResultValidator>,

    /// Per-request alias for `KLENDATHU_CACHE_MODE=force-use`.
    pub force_use_cache: bool,

    /// Adapter override; defaults to the subprocess adapter. Embeddings and
    /// tests supply in-process adapters here.
    pub adapter: Option<Arc<dyn AgentAdapter>>,

    /// Cache directory override; defaults to `KLENDATHU_CACHE` or the
    /// project cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Appended to the rendered prompt.
    pub extra_instructions: Option<String>,
}

/// Drive the agent to produce a value matching `schema`, replaying a cached
/// transcript when one exists for `(instruction, schema)`.
pub async fn implement(
    instruction: &str,
    context: Context,
    schema: Schema,
    options: ImplementOptions,
) -> Result<Value, ImplementError> {
    let request_id = Uuid::new_v4();
    let config = Config::from_env();

    let descriptors = build_descriptors(&context);
    let schema_json = schema.to_json_schema();
    let key = cache::cache_key(instruction, &schema.canonical_json());
    let cache_dir = options.cache_dir.clone().unwrap_or(config.cache_dir);
    let path = cache::cache_path(&cache_dir, &key);

    let cache_mode = if options.force_use_cache {
        CacheMode::ForceUse
    } else {
        config.cache_mode
    };

    debug!(%request_id, %key, ?cache_mode, "implement request");

    if cache_mode != CacheMode::Ignore {
        match cache::load_transcript(&path).await {
            Some(cached) => {
                let (mut evaluator, _completion) =
                    Evaluator::new(&context, Some(schema.clone()), options.validate.clone());
                match replay::replay(&cached, &mut evaluator).await {
                    Ok(value) => {
                        info!(%request_id, "cache hit, replayed {} calls", cached.calls.len());
                        trace::trace_log(&format!("replay hit for {}", key));
                        return Ok(value);
                    }
                    Err(mismatch) => {
                        // Silent fallback: the partially-mutated vars die
                        // with this evaluator; the live run gets a fresh one.
                        warn!(%request_id, %mismatch, "replay mismatch, falling back to live run");
                        trace::trace_log(&format!("replay mismatch for {}: {}", key, mismatch));
                    }
                }
            }
            None if cache_mode == CacheMode::ForceUse => {
                return Err(ImplementError::CacheRequired);
            }
            None => {}
        }
    }

    let rendered = prompt::render_implement(
        instruction,
        &schema_json,
        &descriptors,
        options.extra_instructions.as_deref(),
    );

    let recorder = TranscriptRecorder::new(
        TaskRecord::new(rendered.clone(), Some(schema_json.clone()), descriptors.clone()),
        Some(path),
    );

    let (evaluator, mut completion) =
        Evaluator::new(&context, Some(schema), options.validate.clone());
    let callback_recorder = recorder.clone();
    let callback: ToolCallback = Arc::new(move |tool, code, result| {
        callback_recorder.record_call(tool, code, result.clone());
    });
    let surface = Arc::new(ToolSurface::new(evaluator, callback));

    let adapter = options
        .adapter
        .clone()
        .unwrap_or_else(|| Arc::new(SubprocessAdapter::from_env()));

    let cancel = options.cancel.clone().unwrap_or_default();
    let run_token = cancel.child_token();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let (status_tx, _status_rx) = mpsc::unbounded_channel();

    let task = AgentTask {
        mode: AgentMode::Implement,
        prompt: rendered,
        schema: Some(schema_json),
        context: descriptors,
        tools: surface.definitions(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        pid: std::process::id(),
    };
    let run = AgentRun {
        tools: surface.clone(),
        cancel: run_token.clone(),
        messages: message_tx,
        status: status_tx,
    };

    let pump_recorder = recorder.clone();
    let pump = tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            pump_recorder.record_message(message);
        }
    });

    let adapter_future = adapter.run(task, run);
    tokio::pin!(adapter_future);

    enum RunEnd {
        Settled(Result<Value, ImplementError>),
        Cancelled,
        AdapterDone(anyhow::Result<crate::agent::AgentExit>),
    }

    let end = tokio::select! {
        biased;
        settled = &mut completion => {
            RunEnd::Settled(settled.unwrap_or(Err(ImplementError::AgentExit)))
        }
        _ = cancel.cancelled() => RunEnd::Cancelled,
        ended = &mut adapter_future => RunEnd::AdapterDone(ended),
    };

    let outcome: Result<Value, ImplementError> = match end {
        RunEnd::Settled(settled) => {
            // set_result or bail. Stop the agent and let it wind down.
            run_token.cancel();
            let _ = adapter_future.await;
            settled
        }
        RunEnd::Cancelled => {
            run_token.cancel();
            let _ = adapter_future.await;
            Err(ImplementError::Cancelled)
        }
        RunEnd::AdapterDone(ended) => {
            // The agent finished on its own; the promise is the source of
            // truth regardless of the exit code.
            match completion.try_recv() {
                Ok(settled) => settled,
                Err(_) => match ended {
                    Ok(_) => Err(ImplementError::AgentExit),
                    Err(e) => Err(ImplementError::Adapter(e)),
                },
            }
        }
    };

    // The adapter has returned, so the message sender is gone and the pump
    // drains whatever is left.
    let _ = pump.await;

    recorder.finalize(outcome.is_ok()).await;
    match &outcome {
        Ok(_) => info!(%request_id, "implement request completed"),
        Err(err) => {
            info!(%request_id, %err, "implement request failed");
            trace::trace_log(&format!("implement failed for {}: {}", key, err));
        }
    }
    outcome
}
