//! Caller-supplied context.
//!
//! A request's context is a bag of named live values the agent can read from
//! the sandbox: plain data, error objects (the usual subject of an
//! investigation), and host functions. Entries are owned by the caller for
//! the duration of one request and are never copied into the transcript —
//! only their descriptors are.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Host function callable from sandboxed code.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

/// An error captured into the context.
///
/// Serializes through the sandbox as `{__error: true, name, message, stack}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Capture an error and its source chain. The chain stands in for a
    /// stack trace: one `caused by:` line per source.
    pub fn from_error(name: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            name: name.into(),
            message: error.to_string(),
            stack: stack.join("\n"),
        }
    }
}

/// One live value in the context.
#[derive(Clone)]
pub enum ContextValue {
    Data(Value),
    Error(ErrorValue),
    Function(HostFunction),
}

impl ContextValue {
    fn type_tag(&self) -> String {
        match self {
            Self::Data(Value::Null) => "null".to_string(),
            Self::Data(Value::Bool(_)) => "boolean".to_string(),
            Self::Data(Value::Number(_)) => "number".to_string(),
            Self::Data(Value::String(_)) => "string".to_string(),
            Self::Data(Value::Array(_)) => "array".to_string(),
            Self::Data(Value::Object(_)) => "object".to_string(),
            Self::Error(err) => err.name.clone(),
            Self::Function(_) => "function".to_string(),
        }
    }
}

impl std::fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(v) => f.debug_tuple("Data").field(v).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A context value plus an optional description for the prompt.
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub value: ContextValue,
    pub description: Option<String>,
}

impl ContextItem {
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            value: ContextValue::Data(value.into()),
            description: None,
        }
    }

    pub fn error(error: ErrorValue) -> Self {
        Self {
            value: ContextValue::Error(error),
            description: None,
        }
    }

    pub fn function(f: HostFunction) -> Self {
        Self {
            value: ContextValue::Function(f),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The full context for one request.
pub type Context = HashMap<String, ContextItem>;

/// Prompt-facing metadata for one context entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Derive descriptors from a context, sorted by name for determinism.
///
/// Error entries fold the message and stack into the description so the
/// agent sees them without having to eval first.
pub fn build_descriptors(context: &Context) -> Vec<ContextDescriptor> {
    let mut descriptors: Vec<ContextDescriptor> = context
        .iter()
        .map(|(name, item)| {
            let description = match &item.value {
                ContextValue::Error(err) => {
                    let mut text = item
                        .description
                        .clone()
                        .map(|d| format!("{}\n", d))
                        .unwrap_or_default();
                    text.push_str(&format!("Message: {}", err.message));
                    if !err.stack.is_empty() {
                        text.push_str(&format!("\nStack:\n{}", err.stack));
                    }
                    Some(text)
                }
                _ => item.description.clone(),
            };
            ContextDescriptor {
                name: name.clone(),
                type_tag: item.value.type_tag(),
                description,
            }
        })
        .collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    descriptors
}
