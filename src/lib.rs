//! # klendathu
//!
//! AI-driven runtime code execution with deterministic replay caching.
//!
//! A caller hands over a natural-language instruction, a schema for the
//! result, and a bag of live in-process values. An external LLM agent
//! explores that context through sandboxed code execution, commits one
//! final expression producing the result, and the transcript of executed
//! code is persisted — so the next call with the same `(instruction,
//! schema)` replays the recorded code against fresh context and never
//! touches the agent.
//!
//! ```no_run
//! use klendathu::{implement, Context, ContextItem, FieldSpec, ImplementOptions, Schema};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut context = Context::new();
//! context.insert("numbers".to_string(), ContextItem::data(json!([1, 2, 3, 4, 5])));
//!
//! let schema = Schema::new().field("doubled", FieldSpec::array(FieldSpec::number()));
//! let value = implement(
//!     "Double each number in the input array.",
//!     context,
//!     schema,
//!     ImplementOptions::default(),
//! )
//! .await?;
//! assert_eq!(value, json!({"doubled": [2, 4, 6, 8, 10]}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//! - `sandbox`: the per-request evaluator (rhai engine, console shim,
//!   serialization, completion promise)
//! - `tools`: the `eval` / `set_result` / `bail` surface the agent calls
//! - `transcript`: ordered record of tool calls, persisted best-effort
//! - `cache`: key formation and the on-disk transcript store
//! - `replay`: re-execution of cached transcripts with mismatch detection
//! - `orchestrator`: the `implement` request lifecycle
//! - `investigate`: free-form failure diagnosis on the same machinery
//! - `agent`: the adapter contract plus the subprocess NDJSON adapter

pub mod agent;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod investigate;
pub mod orchestrator;
pub mod prompt;
pub mod replay;
pub mod sandbox;
pub mod schema;
pub mod tools;
mod trace;
pub mod transcript;

pub use agent::{AgentAdapter, AgentExit, AgentMode, AgentRun, AgentTask, StatusMessage, Summary};
pub use config::{CacheMode, Config};
pub use context::{Context, ContextItem, ContextValue, ErrorValue, HostFunction};
pub use error::ImplementError;
pub use investigate::{investigate, Investigation, InvestigateOptions};
pub use orchestrator::{implement, ImplementOptions};
pub use sandbox::{Evaluator, ResultValidator};
pub use schema::{FieldSpec, Schema, ValidationError, ValidationIssue};
