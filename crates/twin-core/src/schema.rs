//! Config field schemas.
//!
//! A schema describes every field a firmware build understands for one config
//! document type. Stored schemas keep the compact untyped layout
//! (`i`, `n`, `t`, `d`, `a`, `b`, `c`) where the type slot may hold a type code,
//! a number or a numeric string. That slot is resolved into a [`ValueType`]
//! once, when the schema is loaded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::format::format_value;

/// Config document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    /// Primary device configuration.
    Main,
    /// Auxiliary sub-device addressed by a slot number > 0.
    Slot,
}

impl DocType {
    /// Select the document type for a slot number.
    pub fn for_slot(slot: u32) -> Self {
        if slot > 0 {
            DocType::Slot
        } else {
            DocType::Main
        }
    }

    /// Get the document type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Main => "config_schema",
            DocType::Slot => "slot_config_schema",
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire encoding of a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// 4-byte big-endian signed integer.
    Int32,
    /// 2-byte big-endian signed integer.
    Int16,
    /// Boolean carried as a 2-byte big-endian integer.
    Bool16,
    /// Zero-padded byte string of the given length.
    FixedString(usize),
}

impl ValueType {
    /// Resolve the untyped schema type slot.
    ///
    /// `"i"`, `"t"` and `"b"` select the numeric types; a number or numeric
    /// string is the declared length of a fixed string.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(code) => match code.as_str() {
                "i" => Some(ValueType::Int32),
                "t" => Some(ValueType::Int16),
                "b" => Some(ValueType::Bool16),
                other => other.trim().parse::<usize>().ok().map(ValueType::FixedString),
            },
            Value::Number(n) => {
                if let Some(len) = n.as_u64() {
                    Some(ValueType::FixedString(len as usize))
                } else {
                    n.as_f64()
                        .filter(|f| f.is_finite() && *f >= 0.0)
                        .map(|f| ValueType::FixedString(f as usize))
                }
            }
            _ => None,
        }
    }

    /// Convert back to the untyped schema type slot.
    pub fn to_raw(&self) -> Value {
        match self {
            ValueType::Int32 => Value::String("i".to_string()),
            ValueType::Int16 => Value::String("t".to_string()),
            ValueType::Bool16 => Value::String("b".to_string()),
            ValueType::FixedString(len) => Value::from(*len as u64),
        }
    }

    /// Number of bytes on the wire.
    pub fn width(&self) -> usize {
        match self {
            ValueType::Int32 => 4,
            ValueType::Int16 | ValueType::Bool16 => 2,
            ValueType::FixedString(len) => *len,
        }
    }

    /// Check if min/max bounds apply to this type.
    pub fn is_ranged(&self) -> bool {
        matches!(self, ValueType::Int32 | ValueType::Int16)
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Int32 => write!(f, "int32"),
            ValueType::Int16 => write!(f, "int16"),
            ValueType::Bool16 => write!(f, "bool16"),
            ValueType::FixedString(len) => write!(f, "string({})", len),
        }
    }
}

/// Schema entry in its stored, untyped layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFieldSchema {
    #[serde(rename = "i")]
    pub index: u32,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "t")]
    pub value_type: Value,
    #[serde(rename = "d", default)]
    pub default: Value,
    #[serde(rename = "a", default)]
    pub description: String,
    #[serde(rename = "b", default)]
    pub min: Value,
    #[serde(rename = "c", default)]
    pub max: Value,
}

/// Definition of one config field for a firmware version and document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldSchema", into = "RawFieldSchema")]
pub struct FieldSchema {
    /// Field index, unique within the schema
    pub index: u32,
    /// Field name, unique within the schema
    pub name: String,
    /// Wire encoding
    pub value_type: ValueType,
    /// Default value as a display string
    pub default: Option<String>,
    /// Human readable description
    pub description: String,
    /// Inclusive lower bound (integer types only)
    pub min: Option<i64>,
    /// Inclusive upper bound (integer types only)
    pub max: Option<i64>,
}

impl FieldSchema {
    /// Create a new field schema without bounds.
    pub fn new(index: u32, name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            index,
            name: name.into(),
            value_type,
            default: None,
            description: String::new(),
            min: None,
            max: None,
        }
    }

    /// Set inclusive bounds.
    pub fn with_range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl TryFrom<RawFieldSchema> for FieldSchema {
    type Error = Error;

    fn try_from(raw: RawFieldSchema) -> Result<Self, Self::Error> {
        let value_type = ValueType::from_raw(&raw.value_type).ok_or_else(|| {
            Error::Schema(format!(
                "field {} has unsupported type {}",
                raw.name, raw.value_type
            ))
        })?;

        let default = match &raw.default {
            Value::Null => None,
            other => Some(format_value(other)),
        };

        let min = parse_bound(&raw.name, "min", &raw.min);
        let max = parse_bound(&raw.name, "max", &raw.max);

        Ok(Self {
            index: raw.index,
            name: raw.name,
            value_type,
            default,
            description: raw.description,
            min,
            max,
        })
    }
}

impl From<FieldSchema> for RawFieldSchema {
    fn from(schema: FieldSchema) -> Self {
        Self {
            index: schema.index,
            name: schema.name,
            value_type: schema.value_type.to_raw(),
            default: schema.default.map(Value::String).unwrap_or(Value::Null),
            description: schema.description,
            min: schema.min.map(Value::from).unwrap_or(Value::Null),
            max: schema.max.map(Value::from).unwrap_or(Value::Null),
        }
    }
}

/// Bounds may be numbers or numeric strings; anything else is unset.
fn parse_bound(field: &str, which: &str, raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) if !s.trim().is_empty() => match s.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(field = %field, "Failed to convert {} {:?} to int", which, s);
                None
            }
        },
        _ => None,
    }
}
