//! Declared tool parameters and argument validation.
//!
//! Tools describe their inputs with a [`ParamSchema`]: a list of named,
//! typed parameters with required flags and defaults. Raw model output is
//! validated against it into [`ToolArgs`], a checked argument set, so tool
//! bodies never see missing required fields, wrong types or stray keys.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

/// Ordered parameter declarations for one tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
    allow_unknown: bool,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        self.push(name.into(), kind, true, None, description.into())
    }

    pub fn optional(self, name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        self.push(name.into(), kind, false, None, description.into())
    }

    /// Optional parameter filled with `default` when absent.
    pub fn with_default(
        self,
        name: impl Into<String>,
        kind: ParamKind,
        default: impl Into<Value>,
        description: impl Into<String>,
    ) -> Self {
        self.push(name.into(), kind, false, Some(default.into()), description.into())
    }

    /// Accept keys that are not declared instead of rejecting them.
    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    fn push(
        mut self,
        name: String,
        kind: ParamKind,
        required: bool,
        default: Option<Value>,
        description: String,
    ) -> Self {
        self.params.retain(|p| p.name != name);
        self.params.push(ParamSpec {
            name,
            kind,
            required,
            default,
            description,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Parse a raw JSON argument string. An empty string means no arguments.
    pub fn parse(&self, raw: &str) -> Result<ToolArgs> {
        let value: Value = if raw.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(raw)
                .map_err(|e| Error::invalid_arguments(format!("arguments are not valid JSON: {e}")))?
        };
        self.validate(&value)
    }

    /// Check `input` against the declared parameters.
    ///
    /// Every problem is reported in one error. Optional parameters that are
    /// absent or `null` take their default when one is declared.
    pub fn validate(&self, input: &Value) -> Result<ToolArgs> {
        let Some(object) = input.as_object() else {
            return Err(Error::invalid_arguments(format!(
                "arguments must be a JSON object, got {}",
                kind_of(input)
            )));
        };

        let mut problems = Vec::new();
        let mut values = Map::new();

        for spec in &self.params {
            match object.get(&spec.name).filter(|v| !v.is_null()) {
                Some(v) if spec.kind.accepts(v) => {
                    values.insert(spec.name.clone(), v.clone());
                }
                Some(v) => problems.push(format!(
                    "field '{}' expected {}, got {}",
                    spec.name,
                    spec.kind.as_str(),
                    kind_of(v)
                )),
                None if spec.required => {
                    problems.push(format!("missing required field '{}'", spec.name));
                }
                None => {
                    if let Some(default) = &spec.default {
                        values.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }

        for (key, value) in object {
            if self.params.iter().any(|p| &p.name == key) {
                continue;
            }
            if self.allow_unknown {
                values.insert(key.clone(), value.clone());
            } else {
                problems.push(format!("unknown field '{key}'"));
            }
        }

        if problems.is_empty() {
            Ok(ToolArgs { values })
        } else {
            Err(Error::invalid_arguments(problems.join("; ")))
        }
    }

    /// JSON Schema advertised to the model.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.params {
            let mut prop = json!({ "type": spec.kind.as_str() });
            if !spec.description.is_empty() {
                prop["description"] = json!(spec.description);
            }
            if let Some(default) = &spec.default {
                prop["default"] = default.clone();
            }
            properties.insert(spec.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_unknown,
        })
    }
}

/// Arguments that passed validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Map<String, Value>,
}

impl ToolArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Required string; a validated schema makes the error path unreachable
    /// for declared required fields.
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| Error::invalid_arguments(format!("missing string field '{name}'")))
    }

    /// Deserialize into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|e| Error::invalid_arguments(format!("argument shape mismatch: {e}")))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone())
    }
}
