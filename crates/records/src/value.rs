//! Field values stored inside records

use crate::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value stored under a field storage key
///
/// Composite entities with an identity are always stored as [`Value::Reference`].
/// [`Value::Object`] holds objects without identity, embedded in their parent.
///
/// Serialized externally tagged so that a reference can never be read back as
/// a plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Number(serde_json::Number),
    String(String),
    Reference(CacheKey),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Convert a JSON scalar (or custom JSON scalar) into a stored value
    ///
    /// JSON objects become embedded [`Value::Object`] maps; no references are created.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON
    ///
    /// # Returns
    /// `None` if the value contains a reference anywhere, since a reference
    /// has no JSON form without being resolved.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        let json = match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Reference(_) => return None,
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
        };
        Some(json)
    }

    /// Whether this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The referenced key, if this is a reference
    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            Value::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// The string content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Reference(_) => "reference",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    /// Collect every reference contained in this value, depth-first
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a CacheKey>) {
        match self {
            Value::Reference(key) => out.push(key),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Object(map) => map.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<CacheKey> for Value {
    fn from(key: CacheKey) -> Self {
        Value::Reference(key)
    }
}
