//! Loosely-typed option maps as entered by operators.
//!
//! Option strings arrive as JSON objects such as
//! `{"cpu-bind": null, "cpu": 1.5, "memory": "2G"}`. `RawParams` is the thin
//! accessor layer; each resource kind owns an explicit `from_params` parser
//! that documents the keys it recognises.

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawParams(Map<String, Value>);

impl RawParams {
    /// Parse a JSON object string.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| CoreError::InvalidOption(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::InvalidOption(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Presence check. Flags such as `cpu-bind` are true when the key exists,
    /// whatever its value.
    pub fn is_set(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String value, or `""` when absent or not a string.
    pub fn string(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// Numeric value; numeric strings are accepted. Absent or unparsable is 0.
    pub fn float(&self, key: &str) -> f64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// List of strings. `None` when absent or when any element is not a string.
    pub fn string_slice(&self, key: &str) -> Option<Vec<String>> {
        let items = self.0.get(key)?.as_array()?;
        items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// The first of `keys` that is set, as a string list.
    pub fn one_of_string_slice(&self, keys: &[&str]) -> Option<Vec<String>> {
        keys.iter()
            .find(|k| self.is_set(k))
            .and_then(|k| self.string_slice(k))
    }
}
