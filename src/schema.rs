//! Result schemas.
//!
//! A [`Schema`] describes the shape of the value the agent must produce:
//! a mapping from field name to a typed descriptor with optional constraints
//! and a human-readable description. It renders to JSON-Schema for the
//! prompt, serializes deterministically for the cache key (field order is a
//! `BTreeMap`), and validates candidate values into a list of
//! `path: message` issues.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Type tag of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// Descriptor for a single schema field.
///
/// Field order in the serialized form is fixed by the struct definition and
/// `Schema`'s `BTreeMap`, so the JSON rendering is stable — the cache key
/// depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Closed set of allowed values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,

    /// Element descriptor for arrays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,

    /// Nested fields for objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, FieldSpec>>,

    /// Optional fields may be absent from the result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl FieldSpec {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            description: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            allowed: None,
            items: None,
            properties: None,
            optional: false,
        }
    }

    pub fn string() -> Self {
        Self::of(FieldKind::String)
    }

    pub fn number() -> Self {
        Self::of(FieldKind::Number)
    }

    pub fn integer() -> Self {
        Self::of(FieldKind::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(FieldKind::Boolean)
    }

    pub fn array(items: FieldSpec) -> Self {
        let mut spec = Self::of(FieldKind::Array);
        spec.items = Some(Box::new(items));
        spec
    }

    pub fn object(schema: Schema) -> Self {
        let mut spec = Self::of(FieldKind::Object);
        spec.properties = Some(schema.fields);
        spec
    }

    pub fn any() -> Self {
        Self::of(FieldKind::Any)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn min(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn max(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub fn min_len(mut self, n: usize) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn max_len(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.allowed = Some(values);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn json_schema(&self) -> Value {
        let mut out = serde_json::Map::new();
        match self.kind {
            FieldKind::Any => {}
            FieldKind::Array => {
                out.insert("type".to_string(), Value::from("array"));
                if let Some(items) = &self.items {
                    out.insert("items".to_string(), items.json_schema());
                }
                if let Some(n) = self.min_length {
                    out.insert("minItems".to_string(), Value::from(n));
                }
                if let Some(n) = self.max_length {
                    out.insert("maxItems".to_string(), Value::from(n));
                }
            }
            FieldKind::Object => {
                out.insert("type".to_string(), Value::from("object"));
                if let Some(props) = &self.properties {
                    let mut rendered = serde_json::Map::new();
                    let mut required = Vec::new();
                    for (name, spec) in props {
                        rendered.insert(name.clone(), spec.json_schema());
                        if !spec.optional {
                            required.push(Value::from(name.clone()));
                        }
                    }
                    out.insert("properties".to_string(), Value::Object(rendered));
                    if !required.is_empty() {
                        out.insert("required".to_string(), Value::Array(required));
                    }
                }
            }
            kind => {
                out.insert("type".to_string(), Value::from(kind.to_string()));
                if let Some(n) = self.minimum {
                    out.insert("minimum".to_string(), Value::from(n));
                }
                if let Some(n) = self.maximum {
                    out.insert("maximum".to_string(), Value::from(n));
                }
                if let Some(n) = self.min_length {
                    out.insert("minLength".to_string(), Value::from(n));
                }
                if let Some(n) = self.max_length {
                    out.insert("maxLength".to_string(), Value::from(n));
                }
                if let Some(allowed) = &self.allowed {
                    out.insert("enum".to_string(), Value::Array(allowed.clone()));
                }
            }
        }
        if let Some(desc) = &self.description {
            out.insert("description".to_string(), Value::from(desc.clone()));
        }
        Value::Object(out)
    }

    fn validate_at(&self, path: &str, value: &Value, issues: &mut Vec<ValidationIssue>) {
        match self.kind {
            FieldKind::Any => {}
            FieldKind::String => match value.as_str() {
                Some(s) => {
                    if let Some(n) = self.min_length {
                        if s.chars().count() < n {
                            issues.push(ValidationIssue::new(
                                path,
                                format!("must be at least {} characters", n),
                            ));
                        }
                    }
                    if let Some(n) = self.max_length {
                        if s.chars().count() > n {
                            issues.push(ValidationIssue::new(
                                path,
                                format!("must be at most {} characters", n),
                            ));
                        }
                    }
                    if let Some(allowed) = &self.allowed {
                        if !allowed.contains(value) {
                            issues.push(ValidationIssue::new(path, "value is not allowed"));
                        }
                    }
                }
                None => issues.push(type_mismatch(path, self.kind, value)),
            },
            FieldKind::Number => match value.as_f64() {
                Some(n) => self.check_range(path, n, issues),
                None => issues.push(type_mismatch(path, self.kind, value)),
            },
            FieldKind::Integer => {
                // Accept only whole numbers, including ones that arrived as floats.
                let as_int = value
                    .as_i64()
                    .map(|n| n as f64)
                    .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0));
                match as_int {
                    Some(n) => self.check_range(path, n, issues),
                    None => issues.push(type_mismatch(path, self.kind, value)),
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    issues.push(type_mismatch(path, self.kind, value));
                }
            }
            FieldKind::Array => match value.as_array() {
                Some(elements) => {
                    if let Some(n) = self.min_length {
                        if elements.len() < n {
                            issues.push(ValidationIssue::new(
                                path,
                                format!("must have at least {} items", n),
                            ));
                        }
                    }
                    if let Some(n) = self.max_length {
                        if elements.len() > n {
                            issues.push(ValidationIssue::new(
                                path,
                                format!("must have at most {} items", n),
                            ));
                        }
                    }
                    if let Some(items) = &self.items {
                        for (i, element) in elements.iter().enumerate() {
                            items.validate_at(&format!("{}[{}]", path, i), element, issues);
                        }
                    }
                }
                None => issues.push(type_mismatch(path, self.kind, value)),
            },
            FieldKind::Object => match value.as_object() {
                Some(map) => {
                    if let Some(props) = &self.properties {
                        for (name, spec) in props {
                            let child = format!("{}.{}", path, name);
                            match map.get(name) {
                                Some(v) => spec.validate_at(&child, v, issues),
                                None if spec.optional => {}
                                None => issues
                                    .push(ValidationIssue::new(&child, "required field is missing")),
                            }
                        }
                    }
                }
                None => issues.push(type_mismatch(path, self.kind, value)),
            },
        }
    }

    fn check_range(&self, path: &str, n: f64, issues: &mut Vec<ValidationIssue>) {
        if let Some(min) = self.minimum {
            if n < min {
                issues.push(ValidationIssue::new(path, format!("must be >= {}", min)));
            }
        }
        if let Some(max) = self.maximum {
            if n > max {
                issues.push(ValidationIssue::new(path, format!("must be <= {}", max)));
            }
        }
    }
}

fn type_mismatch(path: &str, expected: FieldKind, value: &Value) -> ValidationIssue {
    let got = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    ValidationIssue::new(path, format!("expected {}, got {}", expected, got))
}

/// Schema for the agent's result: field name to descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render the JSON-Schema form used in the prompt.
    pub fn to_json_schema(&self) -> Value {
        FieldSpec::object(self.clone()).json_schema()
    }

    /// Canonical JSON used for cache keying. Deterministic: field order is
    /// the `BTreeMap` order and no formatting whitespace is emitted.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate a candidate result value.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        match value.as_object() {
            Some(map) => {
                for (name, spec) in &self.fields {
                    match map.get(name) {
                        Some(v) => spec.validate_at(name, v, &mut issues),
                        None if spec.optional => {}
                        None => {
                            issues.push(ValidationIssue::new(name, "required field is missing"))
                        }
                    }
                }
            }
            None => issues.push(type_mismatch("$", FieldKind::Object, value)),
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

/// One problem found during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validation failure. The display form enumerates every issue as
/// `path: message`, joined by `; ` — this is the text the agent sees.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .issues
            .iter()
            .map(|i| format!("{}: {}", i.path, i.message))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", joined)
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doubled_schema() -> Schema {
        Schema::new().field("doubled", FieldSpec::array(FieldSpec::number()))
    }

    #[test]
    fn accepts_matching_value() {
        let schema = doubled_schema();
        assert!(schema.validate(&json!({"doubled": [2, 4, 6]})).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let schema = doubled_schema();
        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(err.to_string(), "doubled: required field is missing");
    }

    #[test]
    fn rejects_wrong_element_type_with_index_path() {
        let schema = doubled_schema();
        let err = schema.validate(&json!({"doubled": [2, "x"]})).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].path, "doubled[1]");
    }

    #[test]
    fn enforces_numeric_minimum() {
        let schema = Schema::new().field("n", FieldSpec::number().min(0.0));
        let err = schema.validate(&json!({"n": -1})).unwrap_err();
        assert_eq!(err.to_string(), "n: must be >= 0");
        assert!(schema.validate(&json!({"n": 1})).is_ok());
    }

    #[test]
    fn integer_rejects_fractions_but_accepts_whole_floats() {
        let schema = Schema::new().field("n", FieldSpec::integer());
        assert!(schema.validate(&json!({"n": 3})).is_ok());
        assert!(schema.validate(&json!({"n": 3.0})).is_ok());
        assert!(schema.validate(&json!({"n": 3.5})).is_err());
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let schema = Schema::new().field("note", FieldSpec::string().optional());
        assert!(schema.validate(&json!({})).is_ok());
        assert!(schema.validate(&json!({"note": 1})).is_err());
    }

    #[test]
    fn nested_object_paths_use_dots() {
        let schema = Schema::new().field(
            "user",
            FieldSpec::object(Schema::new().field("name", FieldSpec::string())),
        );
        let err = schema.validate(&json!({"user": {}})).unwrap_err();
        assert_eq!(err.issues[0].path, "user.name");
    }

    #[test]
    fn multiple_issues_joined_with_semicolons() {
        let schema = Schema::new()
            .field("a", FieldSpec::number())
            .field("b", FieldSpec::string());
        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "a: required field is missing; b: required field is missing"
        );
    }

    #[test]
    fn non_object_root_is_rejected() {
        let schema = doubled_schema();
        let err = schema.validate(&json!(42)).unwrap_err();
        assert_eq!(err.issues[0].path, "$");
    }

    #[test]
    fn json_schema_renders_object_with_required() {
        let schema = Schema::new()
            .field("n", FieldSpec::number().min(0.0).describe("a count"))
            .field("note", FieldSpec::string().optional());
        let rendered = schema.to_json_schema();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["properties"]["n"]["type"], "number");
        assert_eq!(rendered["properties"]["n"]["minimum"], 0.0);
        assert_eq!(rendered["properties"]["n"]["description"], "a count");
        assert_eq!(rendered["required"], json!(["n"]));
    }

    #[test]
    fn canonical_json_is_stable_across_insertion_order() {
        let a = Schema::new()
            .field("b", FieldSpec::string())
            .field("a", FieldSpec::number());
        let b = Schema::new()
            .field("a", FieldSpec::number())
            .field("b", FieldSpec::string());
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn string_enum_constraint() {
        let schema = Schema::new().field(
            "color",
            FieldSpec::string().one_of(vec![json!("red"), json!("blue")]),
        );
        assert!(schema.validate(&json!({"color": "red"})).is_ok());
        let err = schema.validate(&json!({"color": "green"})).unwrap_err();
        assert_eq!(err.to_string(), "color: value is not allowed");
    }
}
