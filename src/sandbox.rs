//! The sandboxed evaluator.
//!
//! One [`Evaluator`] exists per request. It owns a rhai engine whose scope
//! exposes exactly three identifiers to agent code: `context` (frozen),
//! `vars` (mutable scratch, carried across calls), and `console` (a
//! capturing shim). Code strings are closure expressions; the evaluator
//! invokes them as `let __thunk = (<code>); __thunk.call()`.
//!
//! Every value leaving the sandbox is serialized to JSON: error objects
//! become `{__error: true, name, message, stack}`, collections are recursed
//! with a depth bound, primitives pass through.

use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::context::{Context, ContextValue, ErrorValue, HostFunction};
use crate::error::{ImplementError, SandboxError};
use crate::schema::{Schema, ValidationError, ValidationIssue};

/// Recursion bound for serialization. Self-referencing structures cannot be
/// detected by identity here, so anything deeper than this is replaced by a
/// `{"__cycle": true}` sentinel.
const MAX_SERIALIZE_DEPTH: usize = 64;

/// Caller-supplied extra validation for `set_result` values.
pub type ResultValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Outcome of one request: the validated value, or a structured failure.
pub type CompletionResult = Result<Value, ImplementError>;

// ── Console shim ──────────────────────────────────────────────────

/// One captured console invocation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsoleEntry {
    pub level: String,
    pub args: Vec<Value>,
}

/// Capturing `console` object injected into the sandbox scope.
///
/// Methods `log`/`error`/`warn`/`info`/`debug`/`trace` accept one to three
/// arguments. rhai's own `print`/`debug` statements are routed here too, so
/// nothing reaches the host process stdio.
#[derive(Clone)]
pub struct Console {
    entries: Arc<Mutex<Vec<ConsoleEntry>>>,
}

impl Console {
    fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, level: &str, args: Vec<Dynamic>) {
        let args = args.iter().map(serialize_dynamic).collect();
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(ConsoleEntry {
                level: level.to_string(),
                args,
            });
        }
    }

    fn push_text(&self, level: &str, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(ConsoleEntry {
                level: level.to_string(),
                args: vec![Value::from(text)],
            });
        }
    }

    fn drain(&self) -> Vec<ConsoleEntry> {
        self.entries
            .lock()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default()
    }
}

const CONSOLE_LEVELS: [&str; 6] = ["log", "error", "warn", "info", "debug", "trace"];

fn register_console(engine: &mut Engine) {
    engine.register_type_with_name::<Console>("Console");
    for level in CONSOLE_LEVELS {
        engine.register_fn(level, move |c: &mut Console, a: Dynamic| {
            c.push(level, vec![a]);
        });
        engine.register_fn(level, move |c: &mut Console, a: Dynamic, b: Dynamic| {
            c.push(level, vec![a, b]);
        });
        engine.register_fn(
            level,
            move |c: &mut Console, a: Dynamic, b: Dynamic, d: Dynamic| {
                c.push(level, vec![a, b, d]);
            },
        );
    }
}

// ── Serialization ─────────────────────────────────────────────────

/// Serialize a sandbox value to JSON.
pub fn serialize_dynamic(value: &Dynamic) -> Value {
    serialize_at(value.clone(), 0)
}

fn serialize_at(value: Dynamic, depth: usize) -> Value {
    if depth >= MAX_SERIALIZE_DEPTH {
        return json!({ "__cycle": true });
    }
    let value = value.flatten();
    if value.is_unit() {
        Value::Null
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_int() {
        Value::from(value.as_int().unwrap_or(0))
    } else if value.is_float() {
        Value::from(value.as_float().unwrap_or(0.0))
    } else if value.is_string() {
        Value::from(value.into_string().unwrap_or_default())
    } else if value.is_char() {
        Value::from(value.as_char().map(String::from).unwrap_or_default())
    } else if value.is::<ErrorValue>() {
        let err = value.cast::<ErrorValue>();
        json!({
            "__error": true,
            "name": err.name,
            "message": err.message,
            "stack": err.stack,
        })
    } else if value.is_array() {
        let elements = value.cast::<rhai::Array>();
        Value::Array(
            elements
                .into_iter()
                .map(|e| serialize_at(e, depth + 1))
                .collect(),
        )
    } else if value.is_map() {
        let map = value.cast::<Map>();
        let mut out = serde_json::Map::new();
        for (key, entry) in map {
            out.insert(key.to_string(), serialize_at(entry, depth + 1));
        }
        Value::Object(out)
    } else {
        // Exotic host types fall back to their display form.
        Value::from(value.to_string())
    }
}

/// Whether a serialized value is error-shaped. Replay treats a recorded
/// `ok` that freshly produces one of these as an environment mismatch.
pub fn is_error_shaped(value: &Value) -> bool {
    value.get("__error").and_then(Value::as_bool).unwrap_or(false)
}

// ── Completion promise ────────────────────────────────────────────

/// Single-shot settle guard around a oneshot sender. The first `resolve` or
/// `reject` wins; everything after is a no-op.
pub(crate) struct Completion {
    tx: Mutex<Option<oneshot::Sender<CompletionResult>>>,
}

impl Completion {
    pub(crate) fn channel() -> (Arc<Self>, oneshot::Receiver<CompletionResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn settle(&self, outcome: CompletionResult) -> bool {
        let sender = self.tx.lock().ok().and_then(|mut tx| tx.take());
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }
}

// ── Evaluator ─────────────────────────────────────────────────────

/// Output of one `eval` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutput {
    pub result: Value,
    pub console: Vec<ConsoleEntry>,
}

/// Per-request sandboxed evaluator.
pub struct Evaluator {
    engine: Engine,
    context_map: Map,
    vars: Map,
    console: Console,
    schema: Option<Schema>,
    validator: Option<ResultValidator>,
    completion: Arc<Completion>,
}

impl Evaluator {
    /// Build an evaluator for one request. Returns the evaluator and the
    /// receiving end of its completion promise; the promise settles on the
    /// first successful `set_result` or on `set_bail_error`.
    pub fn new(
        context: &Context,
        schema: Option<Schema>,
        validator: Option<ResultValidator>,
    ) -> (Self, oneshot::Receiver<CompletionResult>) {
        let mut engine = Engine::new();
        let console = Console::new();

        // Reading a property that does not exist is an error, not `()` —
        // replay depends on a vanished context field throwing.
        engine.set_fail_on_invalid_map_property(true);

        register_console(&mut engine);
        engine.register_type_with_name::<ErrorValue>("Error");
        engine.register_get("name", |e: &mut ErrorValue| e.name.clone());
        engine.register_get("message", |e: &mut ErrorValue| e.message.clone());
        engine.register_get("stack", |e: &mut ErrorValue| e.stack.clone());

        // `print`/`debug` from scripts land in the console buffer, never on
        // the host stdio.
        let print_console = console.clone();
        engine.on_print(move |text| print_console.push_text("log", text));
        let debug_console = console.clone();
        engine.on_debug(move |text, _source, _pos| debug_console.push_text("debug", text));

        let mut context_map = Map::new();
        for (name, item) in context {
            match &item.value {
                ContextValue::Data(data) => {
                    let dynamic = rhai::serde::to_dynamic(data).unwrap_or(Dynamic::UNIT);
                    context_map.insert(name.as_str().into(), dynamic);
                }
                ContextValue::Error(err) => {
                    context_map.insert(name.as_str().into(), Dynamic::from(err.clone()));
                }
                ContextValue::Function(f) => {
                    // Host functions are global in the sandbox, named after
                    // their context entry.
                    register_host_fn(&mut engine, name, f.clone());
                }
            }
        }

        let (completion, rx) = Completion::channel();
        (
            Self {
                engine,
                context_map,
                vars: Map::new(),
                console,
                schema,
                validator,
                completion,
            },
            rx,
        )
    }

    /// Execute agent code and serialize its return value. Errors propagate
    /// to the tool surface, which records them.
    pub async fn eval(&mut self, code: &str) -> Result<EvalOutput, SandboxError> {
        let (result, console) = self.run(code)?;
        Ok(EvalOutput { result, console })
    }

    /// Execute the final code, validate against the schema and the optional
    /// caller validator, and resolve the completion promise. A failure here
    /// leaves the promise unsettled so the agent can retry.
    pub async fn set_result(&mut self, code: &str) -> Result<Value, SandboxError> {
        let (value, _console) = self.run(code)?;

        if let Some(schema) = &self.schema {
            schema.validate(&value)?;
        }
        if let Some(validator) = &self.validator {
            validator(&value).map_err(|message| {
                SandboxError::Validation(ValidationError {
                    issues: vec![ValidationIssue {
                        path: "$".to_string(),
                        message,
                    }],
                })
            })?;
        }

        self.completion.settle(Ok(value.clone()));
        Ok(value)
    }

    /// Reject the completion promise on behalf of a bailing agent. Later
    /// `set_result` calls still execute but settle nothing.
    pub fn set_bail_error(&self, message: &str) {
        self.completion
            .settle(Err(ImplementError::Bail(message.to_string())));
    }

    /// Whether the completion promise has already settled.
    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }

    fn run(&mut self, code: &str) -> Result<(Value, Vec<ConsoleEntry>), SandboxError> {
        let script = format!("let __thunk = ({});\n__thunk.call()", code);

        let mut scope = Scope::new();
        scope.push("context", self.context_map.clone());
        scope.push("vars", self.vars.clone());
        scope.push("console", self.console.clone());

        let outcome = self.engine.eval_with_scope::<Dynamic>(&mut scope, &script);

        // Writes to `vars` persist for subsequent calls even when the code
        // ultimately threw.
        if let Some(vars) = scope.get("vars") {
            if let Some(map) = vars.clone().flatten().try_cast::<Map>() {
                self.vars = map;
            }
        }
        let console = self.console.drain();

        match outcome {
            Ok(value) => Ok((serialize_dynamic(&value), console)),
            Err(err) => Err(runtime_error(&err)),
        }
    }
}

fn runtime_error(err: &EvalAltResult) -> SandboxError {
    let position = err.position();
    let stack = if position.is_none() {
        None
    } else {
        Some(format!("at {}", position))
    };
    SandboxError::runtime(err.to_string(), stack)
}

fn register_host_fn(engine: &mut Engine, name: &str, f: HostFunction) {
    let f0 = f.clone();
    engine.register_fn(
        name.to_string(),
        move || -> Result<Dynamic, Box<EvalAltResult>> { call_host(&f0, vec![]) },
    );
    let f1 = f.clone();
    engine.register_fn(
        name.to_string(),
        move |a: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> { call_host(&f1, vec![a]) },
    );
    let f2 = f.clone();
    engine.register_fn(
        name.to_string(),
        move |a: Dynamic, b: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            call_host(&f2, vec![a, b])
        },
    );
    let f3 = f;
    engine.register_fn(
        name.to_string(),
        move |a: Dynamic, b: Dynamic, c: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            call_host(&f3, vec![a, b, c])
        },
    );
}

fn call_host(f: &HostFunction, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
    let json_args: Vec<Value> = args.iter().map(serialize_dynamic).collect();
    match f(json_args) {
        Ok(value) => rhai::serde::to_dynamic(&value),
        Err(message) => Err(message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextItem;
    use crate::schema::FieldSpec;
    use serde_json::json;

    fn evaluator_with(
        entries: Vec<(&str, ContextItem)>,
        schema: Option<Schema>,
    ) -> (Evaluator, oneshot::Receiver<CompletionResult>) {
        let mut context = Context::new();
        for (name, item) in entries {
            context.insert(name.to_string(), item);
        }
        Evaluator::new(&context, schema, None)
    }

    #[tokio::test]
    async fn eval_returns_serialized_value() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        let out = eval.eval("|| 2 + 3").await.unwrap();
        assert_eq!(out.result, json!(5));
        assert!(out.console.is_empty());
    }

    #[tokio::test]
    async fn eval_reads_context() {
        let (mut eval, _rx) = evaluator_with(
            vec![("numbers", ContextItem::data(json!([1, 2, 3])))],
            None,
        );
        let out = eval
            .eval("|| context.numbers.map(|n| n * 2)")
            .await
            .unwrap();
        assert_eq!(out.result, json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn vars_persist_across_calls() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        let out = eval.eval("|| { vars.x = 10; vars.x }").await.unwrap();
        assert_eq!(out.result, json!(10));
        let out = eval.eval("|| { vars.y = 20; vars.y }").await.unwrap();
        assert_eq!(out.result, json!(20));
        let out = eval.eval("|| vars.x + vars.y").await.unwrap();
        assert_eq!(out.result, json!(30));
    }

    #[tokio::test]
    async fn console_capture_preserves_order_and_level() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        let out = eval
            .eval(r#"|| { console.log("first"); console.warn("second", 2); 1 }"#)
            .await
            .unwrap();
        assert_eq!(
            out.console,
            vec![
                ConsoleEntry {
                    level: "log".to_string(),
                    args: vec![json!("first")],
                },
                ConsoleEntry {
                    level: "warn".to_string(),
                    args: vec![json!("second"), json!(2)],
                },
            ]
        );
    }

    #[tokio::test]
    async fn print_is_captured_not_leaked() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        let out = eval.eval(r#"|| { print("hello"); 1 }"#).await.unwrap();
        assert_eq!(out.console[0].level, "log");
        assert_eq!(out.console[0].args, vec![json!("hello")]);
    }

    #[tokio::test]
    async fn console_is_cleared_between_calls() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        eval.eval(r#"|| { console.log("once"); 1 }"#).await.unwrap();
        let out = eval.eval("|| 2").await.unwrap();
        assert!(out.console.is_empty());
    }

    #[tokio::test]
    async fn thrown_errors_surface_as_runtime_errors() {
        let (mut eval, _rx) = evaluator_with(vec![], None);
        let err = eval.eval(r#"|| { throw "broken"; }"#).await.unwrap_err();
        match err {
            SandboxError::Runtime { message, .. } => assert!(message.contains("broken")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn error_values_serialize_with_all_four_fields() {
        let (mut eval, _rx) = evaluator_with(
            vec![(
                "error",
                ContextItem::error(
                    ErrorValue::new("TimeoutError", "connect timed out").with_stack("at fetch"),
                ),
            )],
            None,
        );
        let out = eval.eval("|| context.error").await.unwrap();
        assert_eq!(
            out.result,
            json!({
                "__error": true,
                "name": "TimeoutError",
                "message": "connect timed out",
                "stack": "at fetch",
            })
        );
        assert!(is_error_shaped(&out.result));
    }

    #[tokio::test]
    async fn set_result_resolves_completion() {
        let schema = Schema::new().field("sum", FieldSpec::number());
        let (mut eval, rx) = evaluator_with(vec![], Some(schema));
        let value = eval.set_result("|| #{ sum: 30 }").await.unwrap();
        assert_eq!(value, json!({"sum": 30}));
        let settled = rx.await.unwrap().unwrap();
        assert_eq!(settled, json!({"sum": 30}));
    }

    #[tokio::test]
    async fn failing_set_result_leaves_promise_unsettled_and_permits_retry() {
        let schema = Schema::new().field("n", FieldSpec::number().min(0.0));
        let (mut eval, rx) = evaluator_with(vec![], Some(schema));

        let err = eval.set_result("|| #{ n: -1 }").await.unwrap_err();
        assert_eq!(err.message(), "n: must be >= 0");
        assert!(!eval.is_settled());

        let value = eval.set_result("|| #{ n: 1 }").await.unwrap();
        assert_eq!(value, json!({"n": 1}));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn caller_validator_rejection_is_a_validation_error() {
        let schema = Schema::new().field("n", FieldSpec::number());
        let mut context = Context::new();
        context.insert("unused".to_string(), ContextItem::data(0));
        let validator: ResultValidator = Arc::new(|value| {
            if value["n"] == json!(13) {
                Err("13 is not acceptable".to_string())
            } else {
                Ok(())
            }
        });
        let (mut eval, _rx) = Evaluator::new(&context, Some(schema), Some(validator));
        let err = eval.set_result("|| #{ n: 13 }").await.unwrap_err();
        assert_eq!(err.message(), "$: 13 is not acceptable");
    }

    #[tokio::test]
    async fn bail_rejects_and_later_set_result_is_a_noop_on_the_promise() {
        let schema = Schema::new().field("n", FieldSpec::number());
        let (mut eval, rx) = evaluator_with(vec![], Some(schema));

        eval.set_bail_error("cannot satisfy impossible constraint");
        assert!(eval.is_settled());

        // The code still executes and returns its value to the tool surface.
        let value = eval.set_result("|| #{ n: 1 }").await.unwrap();
        assert_eq!(value, json!({"n": 1}));

        let outcome = rx.await.unwrap();
        let err = outcome.unwrap_err();
        assert!(err
            .to_string()
            .contains("Agent could not complete the task: cannot satisfy impossible constraint"));
    }

    #[tokio::test]
    async fn host_functions_are_callable_by_context_name() {
        let f: HostFunction = Arc::new(|args| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 10))
        });
        let (mut eval, _rx) = evaluator_with(vec![("scale", ContextItem::function(f))], None);
        let out = eval.eval("|| scale(4)").await.unwrap();
        assert_eq!(out.result, json!(40));
    }

    #[tokio::test]
    async fn host_function_errors_propagate_as_runtime_errors() {
        let f: HostFunction = Arc::new(|_| Err("backend refused".to_string()));
        let (mut eval, _rx) = evaluator_with(vec![("fetch", ContextItem::function(f))], None);
        let err = eval.eval("|| fetch()").await.unwrap_err();
        assert!(err.message().contains("backend refused"));
    }

    #[tokio::test]
    async fn context_is_frozen_between_calls() {
        let (mut eval, _rx) = evaluator_with(vec![("n", ContextItem::data(1))], None);
        eval.eval("|| { context.n = 99; context.n }").await.unwrap();
        let out = eval.eval("|| context.n").await.unwrap();
        assert_eq!(out.result, json!(1));
    }

    #[test]
    fn serialization_depth_is_bounded() {
        let mut inner = Map::new();
        inner.insert("leaf".into(), Dynamic::from(1_i64));
        let mut value = Dynamic::from(inner);
        for _ in 0..(MAX_SERIALIZE_DEPTH + 4) {
            let mut wrapper = Map::new();
            wrapper.insert("next".into(), value);
            value = Dynamic::from(wrapper);
        }
        let serialized = serialize_dynamic(&value);
        assert!(serde_json::to_string(&serialized)
            .unwrap()
            .contains("__cycle"));
    }
}
