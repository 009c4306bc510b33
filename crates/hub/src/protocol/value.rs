// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed prompt values and canonical JSON rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A prompt default or choice value with its origin type preserved.
///
/// Untagged: variants are tried top to bottom, so a JSON `true` stays a
/// bool and `3` stays an integer instead of collapsing into a double.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptResponseValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<PromptResponseValue>),
    Object(BTreeMap<String, PromptResponseValue>),
}

impl PromptResponseValue {
    /// Convert into a plain JSON value for the outgoing envelope.
    pub fn to_json(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value) => value,
            Err(_) => Value::Null,
        }
    }
}

/// Render arbitrary JSON as a display string.
///
/// Scalars render bare (no quotes); integral numbers below 10^15 render
/// without a decimal point; arrays and objects render as canonical JSON
/// with sorted keys.
pub fn json_to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(_) => render_number(value),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => canonical_json(value),
    }
}

/// Canonical JSON: compact, object keys sorted, integral numbers without
/// decimals.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(_) => render_number(value),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_owned()),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .filter_map(|k| {
                    map.get(*k).map(|v| {
                        format!(
                            "{}:{}",
                            serde_json::to_string(k).unwrap_or_else(|_| "\"\"".to_owned()),
                            canonical_json(v)
                        )
                    })
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

const INTEGRAL_LIMIT: f64 = 1e15;

fn render_number(value: &Value) -> String {
    if let Some(i) = value.as_i64() {
        if (i as f64).abs() < INTEGRAL_LIMIT {
            return i.to_string();
        }
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f.abs() < INTEGRAL_LIMIT {
            return format!("{}", f as i64);
        }
        return f.to_string();
    }
    value.to_string()
}

#[cfg(test)]
#[path = "value_tests.rs"]
mod tests;
