//! Failure taxonomy.
//!
//! Sandbox and validation errors stay between the evaluator and the agent
//! (the agent sees them as retryable tool errors). Everything in
//! [`ImplementError`] surfaces to the caller as the rejection of exactly one
//! request.

use thiserror::Error;

/// Failures visible to the caller of [`implement`](crate::implement) or
/// [`investigate`](crate::investigate).
#[derive(Debug, Error)]
pub enum ImplementError {
    /// The agent gave up and called the `bail` tool.
    #[error("Agent could not complete the task: {0}")]
    Bail(String),

    /// The agent finished without a successful `set_result`.
    #[error("agent exited without completion")]
    AgentExit,

    /// The caller's cancellation handle fired.
    #[error("request cancelled")]
    Cancelled,

    /// `KLENDATHU_CACHE_MODE=force-use` and no cached transcript exists.
    #[error("cache mode is force-use but no cached transcript exists for this task")]
    CacheRequired,

    /// The agent adapter itself failed (spawn error, broken pipe, ...).
    #[error("agent adapter failed: {0}")]
    Adapter(anyhow::Error),
}

/// Error raised inside the sandbox, visible to the agent only.
///
/// `Runtime` is a throw from the executed code; `Validation` is a
/// `set_result` return value that does not match the schema (or that the
/// caller-supplied validator rejected). Both are recorded in the transcript
/// as `error` results and returned to the agent so it can retry.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{message}")]
    Runtime {
        message: String,
        stack: Option<String>,
    },

    #[error("{0}")]
    Validation(#[from] crate::schema::ValidationError),
}

impl SandboxError {
    pub fn runtime(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            stack,
        }
    }

    /// The message recorded in the transcript.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The stack recorded in the transcript, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Runtime { stack, .. } => stack.as_deref(),
            Self::Validation(_) => None,
        }
    }
}
