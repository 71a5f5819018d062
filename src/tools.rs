//! The tool surface exposed to the agent.
//!
//! Three tools, each taking a single string parameter: `eval` runs
//! exploratory code, `set_result` commits the final expression, `bail`
//! reports that the task cannot be done. Every invocation is reported to
//! the on-tool-call callback (which feeds the transcript) before the
//! response goes back to the agent.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::SandboxError;
use crate::sandbox::Evaluator;
use crate::transcript::ToolResult;

/// Textual response returned to the agent for one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub text: String,
    pub is_error: bool,
}

impl ToolResponse {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Invoked with `(tool, code, result)` for every call, before the response
/// returns to the agent. The transcript recorder hangs off this.
pub type ToolCallback = Arc<dyn Fn(&str, &str, &ToolResult) + Send + Sync>;

/// Tool metadata handed to the agent adapter.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn single_string_parameter(name: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            name: { "type": "string", "description": description }
        },
        "required": [name],
    })
}

/// One tool the agent can invoke.
#[async_trait]
trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// `(parameter name, parameter description)` — every tool takes exactly
    /// one string.
    fn parameter(&self) -> (&str, &str);

    /// Execute against the request's evaluator. Returns the record for the
    /// transcript and the response for the agent.
    async fn execute(&self, evaluator: &mut Evaluator, arg: &str) -> (ToolResult, ToolResponse);
}

fn sandbox_failure(err: &SandboxError) -> (ToolResult, ToolResponse) {
    let message = err.message();
    let stack = err.stack().map(|s| s.to_string());
    let text = match &stack {
        Some(stack) => format!("{}\n{}", message, stack),
        None => message.clone(),
    };
    (ToolResult::err(message, stack), ToolResponse::error(text))
}

struct EvalTool;

#[async_trait]
impl Tool for EvalTool {
    fn name(&self) -> &str {
        "eval"
    }

    fn description(&self) -> &str {
        "Evaluates a closure expression with access to `context` (read-only), \
         `vars` (scratch state shared across calls), and a capturing `console`. \
         Returns the serialized result plus any console output."
    }

    fn parameter(&self) -> (&str, &str) {
        (
            "code",
            "Closure expression to evaluate, e.g. `|| context.numbers.len()`",
        )
    }

    async fn execute(&self, evaluator: &mut Evaluator, arg: &str) -> (ToolResult, ToolResponse) {
        match evaluator.eval(arg).await {
            Ok(output) => {
                let mut data = json!({ "result": output.result });
                if !output.console.is_empty() {
                    data["console"] = serde_json::to_value(&output.console).unwrap_or(Value::Null);
                }
                let text = serde_json::to_string_pretty(&data)
                    .unwrap_or_else(|_| data.to_string());
                (ToolResult::ok(data), ToolResponse::ok(text))
            }
            Err(err) => sandbox_failure(&err),
        }
    }
}

struct SetResultTool;

#[async_trait]
impl Tool for SetResultTool {
    fn name(&self) -> &str {
        "set_result"
    }

    fn description(&self) -> &str {
        "Commits the final result by evaluating a closure expression. The \
         returned value is validated against the expected schema; on failure \
         you may fix the code and call set_result again."
    }

    fn parameter(&self) -> (&str, &str) {
        (
            "code",
            "Closure expression producing the final result, e.g. `|| #{ sum: vars.total }`",
        )
    }

    async fn execute(&self, evaluator: &mut Evaluator, arg: &str) -> (ToolResult, ToolResponse) {
        match evaluator.set_result(arg).await {
            Ok(value) => (ToolResult::ok(value), ToolResponse::ok("Result computed")),
            Err(err) => {
                let (result, mut response) = sandbox_failure(&err);
                response.text.push_str(
                    "\n\nPlease fix the errors and call set_result again with valid code.",
                );
                (result, response)
            }
        }
    }
}

struct BailTool;

#[async_trait]
impl Tool for BailTool {
    fn name(&self) -> &str {
        "bail"
    }

    fn description(&self) -> &str {
        "Reports that the task cannot be completed. Provide a clear reason; \
         the caller receives it as the failure message."
    }

    fn parameter(&self) -> (&str, &str) {
        ("message", "Why the task cannot be completed")
    }

    async fn execute(&self, evaluator: &mut Evaluator, arg: &str) -> (ToolResult, ToolResponse) {
        evaluator.set_bail_error(arg);
        (
            ToolResult::ok(Value::Null),
            ToolResponse::error(format!("Implementation failed: {}", arg)),
        )
    }
}

/// Dispatches agent tool invocations to one request's evaluator, strictly in
/// submission order (the evaluator sits behind a mutex).
pub struct ToolSurface {
    evaluator: Mutex<Evaluator>,
    tools: Vec<Arc<dyn Tool>>,
    on_tool_call: ToolCallback,
}

impl ToolSurface {
    /// The full implement-mode surface: `eval`, `set_result`, `bail`.
    pub fn new(evaluator: Evaluator, on_tool_call: ToolCallback) -> Self {
        let tools: Vec<Arc<dyn Tool>> =
            vec![Arc::new(EvalTool), Arc::new(SetResultTool), Arc::new(BailTool)];
        Self {
            evaluator: Mutex::new(evaluator),
            tools,
            on_tool_call,
        }
    }

    /// The investigate-mode surface: `eval` only.
    pub fn eval_only(evaluator: Evaluator, on_tool_call: ToolCallback) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EvalTool)];
        Self {
            evaluator: Mutex::new(evaluator),
            tools,
            on_tool_call,
        }
    }

    /// Tool metadata for the agent adapter.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| {
                let (param, param_desc) = t.parameter();
                ToolDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: single_string_parameter(param, param_desc),
                }
            })
            .collect()
    }

    /// Execute one tool invocation and report it to the callback.
    pub async fn dispatch(&self, tool: &str, arg: &str) -> ToolResponse {
        let Some(tool_impl) = self.tools.iter().find(|t| t.name() == tool).cloned() else {
            let result = ToolResult::err(format!("Unknown tool: {}", tool), None);
            (self.on_tool_call)(tool, arg, &result);
            return ToolResponse::error(format!("Unknown tool: {}", tool));
        };

        let mut evaluator = self.evaluator.lock().await;
        let (result, response) = tool_impl.execute(&mut evaluator, arg).await;
        (self.on_tool_call)(tool, arg, &result);
        response
    }

    /// Whether the request's completion promise has settled.
    pub async fn is_settled(&self) -> bool {
        self.evaluator.lock().await.is_settled()
    }
}
