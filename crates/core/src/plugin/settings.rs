//! Declarative plugin settings
//!
//! Settings are described by a schema value — name, label, kind, constraints
//! — and validated against that schema, never against the plugin type
//! itself. Binding rejects unknown keys, rejects missing required keys,
//! coerces integers to floats, and enforces per-kind constraints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Kind-specific shape and constraints of a settings field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form text
    Text {
        default: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// Floating-point number; integer values are coerced
    Number {
        default: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Boolean toggle
    Switch { default: bool },
}

/// One declared settings field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsField {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl SettingsField {
    /// Text field with the given default
    pub fn text(name: impl Into<String>, label: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            required: false,
            kind: FieldKind::Text {
                default: default.into(),
                min_length: None,
                max_length: None,
                pattern: None,
            },
        }
    }

    /// Number field with the given default
    pub fn number(name: impl Into<String>, label: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            required: false,
            kind: FieldKind::Number {
                default,
                min: None,
                max: None,
            },
        }
    }

    /// Switch field with the given default
    pub fn switch(name: impl Into<String>, label: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            required: false,
            kind: FieldKind::Switch { default },
        }
    }

    /// Mark the field required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Length bounds; only meaningful on text fields
    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        if let FieldKind::Text {
            min_length,
            max_length,
            ..
        } = &mut self.kind
        {
            *min_length = min;
            *max_length = max;
        }
        self
    }

    /// Regex the value must match; only meaningful on text fields
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        if let FieldKind::Text { pattern: p, .. } = &mut self.kind {
            *p = Some(pattern.into());
        }
        self
    }

    /// Numeric range; only meaningful on number fields
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        if let FieldKind::Number { min: lo, max: hi, .. } = &mut self.kind {
            *lo = min;
            *hi = max;
        }
        self
    }

    /// Default value for this field
    pub fn default_value(&self) -> Value {
        match &self.kind {
            FieldKind::Text { default, .. } => Value::String(default.clone()),
            FieldKind::Number { default, .. } => {
                Value::Number(serde_json::Number::from_f64(*default).unwrap_or_else(|| 0.into()))
            }
            FieldKind::Switch { default } => Value::Bool(*default),
        }
    }

    fn check(&self, value: &Value) -> Result<Value> {
        match &self.kind {
            FieldKind::Text {
                min_length,
                max_length,
                pattern,
                ..
            } => {
                let text = value.as_str().ok_or_else(|| {
                    Error::Settings(format!("field '{}' expects text", self.name))
                })?;
                if let Some(min) = min_length {
                    if text.chars().count() < *min {
                        return Err(Error::Settings(format!(
                            "field '{}' is shorter than {} characters",
                            self.name, min
                        )));
                    }
                }
                if let Some(max) = max_length {
                    if text.chars().count() > *max {
                        return Err(Error::Settings(format!(
                            "field '{}' is longer than {} characters",
                            self.name, max
                        )));
                    }
                }
                if let Some(pattern) = pattern {
                    let regex = Regex::new(pattern).map_err(|e| {
                        Error::Settings(format!("field '{}' has an invalid pattern: {e}", self.name))
                    })?;
                    if !regex.is_match(text) {
                        return Err(Error::Settings(format!(
                            "field '{}' does not match pattern {}",
                            self.name, pattern
                        )));
                    }
                }
                Ok(Value::String(text.to_string()))
            }
            FieldKind::Number { min, max, .. } => {
                let number = value.as_f64().ok_or_else(|| {
                    Error::Settings(format!("field '{}' expects a number", self.name))
                })?;
                if let Some(min) = min {
                    if number < *min {
                        return Err(Error::Settings(format!(
                            "field '{}' is below the minimum of {}",
                            self.name, min
                        )));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        return Err(Error::Settings(format!(
                            "field '{}' is above the maximum of {}",
                            self.name, max
                        )));
                    }
                }
                Ok(Value::Number(
                    serde_json::Number::from_f64(number).unwrap_or_else(|| 0.into()),
                ))
            }
            FieldKind::Switch { .. } => {
                let flag = value.as_bool().ok_or_else(|| {
                    Error::Settings(format!("field '{}' expects a boolean", self.name))
                })?;
                Ok(Value::Bool(flag))
            }
        }
    }
}

/// Validate raw values against a schema and return the bound map
///
/// The result contains every declared field: provided values are checked and
/// coerced, absent optional fields fall back to their defaults. Unknown keys
/// and missing required keys are rejected.
pub fn bind_settings(
    schema: &[SettingsField],
    values: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    for key in values.keys() {
        if !schema.iter().any(|field| field.name == *key) {
            return Err(Error::Settings(format!("unknown settings field: {key}")));
        }
    }

    let mut bound = Map::new();
    for field in schema {
        match values.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(Error::Settings(format!(
                        "missing required settings field: {}",
                        field.name
                    )));
                }
                bound.insert(field.name.clone(), field.default_value());
            }
            Some(value) => {
                bound.insert(field.name.clone(), field.check(value)?);
            }
        }
    }
    Ok(bound)
}
