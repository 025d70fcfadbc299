//! Property schema: the externally supplied key → type/permission/layout
//! table, loaded once and immutable for a session's lifetime.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::PropertyError;

/// JSON value class a property carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Boolean,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl PropertyKind {
    pub fn is_compound(self) -> bool {
        matches!(self, Self::Array | Self::Object)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Read/write permission of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Access {
    R,
    W,
    RW,
}

impl Access {
    pub fn writable(self) -> bool {
        matches!(self, Self::W | Self::RW)
    }
}

fn default_access() -> Access {
    Access::R
}

/// One schema entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDef {
    pub key: String,
    #[serde(rename = "jsonType")]
    pub kind: PropertyKind,
    #[serde(default = "default_access")]
    pub rw: Access,
    /// Decompose this compound value into child entries.
    #[serde(default)]
    pub split: bool,
    /// Human-readable labels keyed by the stringified wire value.
    #[serde(default, rename = "valueMap")]
    pub value_map: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SchemaDoc {
    properties: Vec<PropertyDef>,
}

/// Immutable key → definition table.
#[derive(Debug)]
pub struct Schema {
    props: HashMap<String, PropertyDef>,
}

impl Schema {
    /// Built-in table covering the known firmware surface.
    pub fn builtin() -> Self {
        Self::from_json(include_str!("schema/properties.json"))
            .expect("embedded property schema is valid")
    }

    /// Parses a schema document; callers may supply their own table to track
    /// firmware ahead of this crate.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let doc: SchemaDoc = serde_json::from_str(text)?;
        let props = doc
            .properties
            .into_iter()
            .map(|def| (def.key.clone(), def))
            .collect();
        Ok(Self { props })
    }

    pub fn get(&self, key: &str) -> Option<&PropertyDef> {
        self.props.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Label for a value of `key`, when the schema carries a value map.
    pub fn label(&self, key: &str, value: &Value) -> Option<&str> {
        let def = self.props.get(key)?;
        let lookup = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        def.value_map.get(&lookup).map(String::as_str)
    }

    /// Coerces a raw value to the declared type of `key` using the fixed rule
    /// table. Keys absent from the schema pass through unchanged; the write
    /// path rejects them before coercion is reached.
    pub fn coerce(&self, key: &str, value: Value) -> Result<Value, PropertyError> {
        match self.props.get(key) {
            Some(def) => coerce_kind(def.kind, value, key),
            None => Ok(value),
        }
    }
}

fn coerce_kind(kind: PropertyKind, value: Value, key: &str) -> Result<Value, PropertyError> {
    let uncoercible = |value: &Value| PropertyError::Uncoercible {
        key: key.to_string(),
        expected: kind.name(),
        value: value.to_string(),
    };

    match kind {
        PropertyKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(uncoercible(&value)),
            },
            _ => Err(uncoercible(&value)),
        },
        PropertyKind::Integer => match &value {
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::from(f as i64))
                } else {
                    Err(uncoercible(&value))
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(Value::from(i))
                } else if let Ok(f) = trimmed.parse::<f64>() {
                    if f.is_finite() {
                        Ok(Value::from(f as i64))
                    } else {
                        Err(uncoercible(&value))
                    }
                } else {
                    Err(uncoercible(&value))
                }
            }
            _ => Err(uncoercible(&value)),
        },
        PropertyKind::Float => match &value {
            Value::Bool(b) => Ok(Value::from(if *b { 1.0 } else { 0.0 })),
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| uncoercible(&value)),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::from(f)),
                _ => Err(uncoercible(&value)),
            },
            _ => Err(uncoercible(&value)),
        },
        PropertyKind::String => match &value {
            Value::String(_) => Ok(value),
            Value::Bool(b) => Ok(Value::from(b.to_string())),
            Value::Number(n) => Ok(Value::from(n.to_string())),
            _ => Err(uncoercible(&value)),
        },
        // Compound values travel as-is; their shape is the device's concern.
        PropertyKind::Array | PropertyKind::Object => Ok(value),
    }
}
