//! Prompt rendering for the agent.

use serde_json::Value;

use crate::context::ContextDescriptor;

fn render_context(descriptors: &[ContextDescriptor]) -> String {
    if descriptors.is_empty() {
        return "(empty)".to_string();
    }
    descriptors
        .iter()
        .map(|d| match &d.description {
            Some(desc) => format!("- **{}** ({}): {}", d.name, d.type_tag, desc),
            None => format!("- **{}** ({})", d.name, d.type_tag),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the implement-mode prompt.
pub fn render_implement(
    instruction: &str,
    schema_json: &Value,
    descriptors: &[ContextDescriptor],
    extra_instructions: Option<&str>,
) -> String {
    let schema_text = serde_json::to_string_pretty(schema_json)
        .unwrap_or_else(|_| schema_json.to_string());
    let extra = extra_instructions
        .map(|text| format!("\n## Additional Instructions\n{}\n", text))
        .unwrap_or_default();

    format!(
        r#"You are implementing a result inside a running program.

## Task
{instruction}

## Available Context
The `context` variable exposes these entries:
{context}

## Working Rules
1. Use the `eval` tool to inspect context and try things; assign into `vars` to carry state between calls
2. Keep exploration cheap - every eval call executes live code
3. When confident, commit exactly one final expression with `set_result`
4. If validation fails, fix the code and call `set_result` again
5. If the task truly cannot be done, call `bail` with a clear reason

## Expected Result Schema
The value passed to `set_result` must match:
{schema}
{extra}"#,
        instruction = instruction,
        context = render_context(descriptors),
        schema = schema_text,
        extra = extra,
    )
}

/// Render the investigate-mode prompt.
pub fn render_investigate(
    descriptors: &[ContextDescriptor],
    extra_instructions: Option<&str>,
) -> String {
    let extra = extra_instructions
        .map(|text| format!("\n## Additional Instructions\n{}\n", text))
        .unwrap_or_default();

    format!(
        r#"You are investigating a failure inside a running program.

## Available Context
The `context` variable exposes these entries:
{context}

## Working Rules
1. Use the `eval` tool to inspect the error and the surrounding state
2. Form and test hypotheses with further eval calls before concluding
3. Finish with a plain-text diagnosis: what went wrong, where, and the most likely fix
{extra}"#,
        context = render_context(descriptors),
        extra = extra,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn implement_prompt_names_context_and_schema() {
        let descriptors = vec![ContextDescriptor {
            name: "numbers".to_string(),
            type_tag: "array".to_string(),
            description: Some("the input".to_string()),
        }];
        let prompt = render_implement(
            "Double each number",
            &json!({"type": "object"}),
            &descriptors,
            None,
        );
        assert!(prompt.contains("Double each number"));
        assert!(prompt.contains("**numbers** (array): the input"));
        assert!(prompt.contains("\"type\": \"object\""));
    }

    #[test]
    fn empty_context_is_marked() {
        let prompt = render_investigate(&[], Some("focus on the database"));
        assert!(prompt.contains("(empty)"));
        assert!(prompt.contains("focus on the database"));
    }
}
