//! Dotted-path overrides applied onto a base configuration tree.
//!
//! A path such as `clawdata.num_cells.0` walks object keys and array
//! indices that already exist in the base configuration. Paths never create
//! new fields: a job that names an unknown parameter fails instead of
//! silently running with its default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SweepError};

/// Configuration object produced by a setup callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigObject(Value);

impl ConfigObject {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(Value::Object(serde_json::Map::new()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.0;
        for token in split_path(path).ok()? {
            cur = match cur {
                Value::Object(map) => map.get(token)?,
                Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Replaces the value at `path`, keeping the declared type of the slot.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let tokens = split_path(path)?;
        let mut cur = &mut self.0;
        for (depth, token) in tokens.iter().enumerate() {
            cur = match cur {
                Value::Object(map) => map.get_mut(*token).ok_or_else(|| {
                    invalid(path, format!("no field '{}' at {}", token, prefix(&tokens, depth)))
                })?,
                Value::Array(items) => {
                    let len = items.len();
                    let idx: usize = token.parse().map_err(|_| {
                        invalid(path, format!("'{}' is not a valid array index", token))
                    })?;
                    items.get_mut(idx).ok_or_else(|| {
                        invalid(
                            path,
                            format!("array index {} out of bounds (len {})", idx, len),
                        )
                    })?
                }
                other => {
                    return Err(invalid(
                        path,
                        format!(
                            "cannot descend into {} at {}",
                            value_type_name(other),
                            prefix(&tokens, depth)
                        ),
                    ))
                }
            };
        }
        if !type_compatible(cur, &value) {
            return Err(invalid(
                path,
                format!(
                    "type mismatch: expected {}, got {}",
                    value_type_name(cur),
                    value_type_name(&value)
                ),
            ));
        }
        *cur = value;
        Ok(())
    }
}

impl From<Value> for ConfigObject {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

pub struct ParameterInjector;

impl ParameterInjector {
    /// Applies each override in key order and returns the updated object.
    pub fn apply(
        mut base: ConfigObject,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ConfigObject> {
        Self::apply_in_place(&mut base, overrides)?;
        Ok(base)
    }

    /// Stops at the first failing path. Overrides before it stay applied, so
    /// callers must discard the object on error.
    pub fn apply_in_place(
        base: &mut ConfigObject,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<()> {
        warn_overlapping(overrides);
        for (path, value) in overrides {
            if let Err(err) = base.set(path, value.clone()) {
                tracing::error!(path = %path, error = %err, "override failed");
                return Err(err);
            }
            tracing::info!("reset {} = {}", path, value);
        }
        Ok(())
    }
}

fn warn_overlapping(overrides: &BTreeMap<String, Value>) {
    for (outer, inner) in overlapping_paths(overrides) {
        tracing::warn!(
            outer = %outer,
            inner = %inner,
            "overlapping override paths; applying in key order"
        );
    }
}

/// Pairs where one override path is a dotted prefix of another.
fn overlapping_paths(overrides: &BTreeMap<String, Value>) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for inner in overrides.keys() {
        let mut end = 0;
        while let Some(dot) = inner[end..].find('.') {
            end += dot;
            let outer = &inner[..end];
            if let Some((key, _)) = overrides.get_key_value(outer) {
                pairs.push((key.as_str(), inner.as_str()));
            }
            end += 1;
        }
    }
    pairs
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.trim().is_empty() {
        return Err(invalid(path, "path is empty".to_string()));
    }
    let tokens: Vec<&str> = path.split('.').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(invalid(path, "path has an empty segment".to_string()));
    }
    Ok(tokens)
}

fn prefix(tokens: &[&str], depth: usize) -> String {
    if depth == 0 {
        "<root>".to_string()
    } else {
        tokens[..depth].join(".")
    }
}

fn invalid(path: &str, reason: String) -> SweepError {
    SweepError::InvalidOverridePath {
        path: path.to_string(),
        reason,
    }
}

fn type_compatible(existing: &Value, new: &Value) -> bool {
    match existing {
        Value::Null => true,
        Value::Bool(_) => new.is_boolean(),
        Value::Number(n) if n.is_f64() => new.is_number(),
        Value::Number(_) => new.is_i64() || new.is_u64(),
        Value::String(_) => new.is_string(),
        Value::Array(_) => new.is_array(),
        Value::Object(_) => new.is_object(),
    }
}

fn value_type_name(value: &Value) -> &'static str {
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
