//! Binary field codec.
//!
//! Turns human-supplied string values into the fixed-width big-endian encoding
//! devices expect, and back. Integer fields are range-checked against the
//! schema bounds and against the width of the wire type; fixed strings are
//! length-checked and zero padded.

use crate::error::{Error, RangeBound, Result, ValidationError};
use crate::schema::{FieldSchema, ValueType};

/// Encode a value for the wire.
pub fn encode(schema: &FieldSchema, value: &str) -> std::result::Result<Vec<u8>, ValidationError> {
    match schema.value_type {
        ValueType::Int32 => {
            let v = parse_int(schema, value)?;
            check_range(schema, v, i32::MIN as i64, i32::MAX as i64)?;
            Ok((v as i32).to_be_bytes().to_vec())
        }
        ValueType::Int16 => {
            let v = parse_int(schema, value)?;
            check_range(schema, v, i16::MIN as i64, i16::MAX as i64)?;
            Ok((v as i16).to_be_bytes().to_vec())
        }
        ValueType::Bool16 => {
            let flag = parse_bool(value).ok_or_else(|| ValidationError::InvalidValue {
                field: schema.name.clone(),
                value: value.to_string(),
                reason: "not a boolean".to_string(),
            })?;
            Ok((flag as i16).to_be_bytes().to_vec())
        }
        ValueType::FixedString(len) => {
            let bytes = value.as_bytes();
            if bytes.len() > len {
                return Err(ValidationError::TooLong {
                    field: schema.name.clone(),
                    len: bytes.len(),
                    max: len,
                });
            }
            let mut buf = Vec::with_capacity(len);
            buf.extend_from_slice(bytes);
            buf.resize(len, 0);
            Ok(buf)
        }
    }
}

/// Decode a wire value into its display string.
///
/// Booleans decode to the raw integer (`"1"`/`"0"`). Fixed strings lose their
/// trailing run of zero bytes only; zero bytes before that run are kept.
/// Bytes beyond the width of an integer type are ignored.
pub fn decode(schema: &FieldSchema, bytes: &[u8]) -> Result<String> {
    match schema.value_type {
        ValueType::Int32 => {
            let raw: [u8; 4] = take(schema, bytes)?;
            Ok(i32::from_be_bytes(raw).to_string())
        }
        ValueType::Int16 | ValueType::Bool16 => {
            let raw: [u8; 2] = take(schema, bytes)?;
            Ok(i16::from_be_bytes(raw).to_string())
        }
        ValueType::FixedString(_) => {
            let end = bytes
                .iter()
                .rposition(|b| *b != 0)
                .map(|pos| pos + 1)
                .unwrap_or(0);
            String::from_utf8(bytes[..end].to_vec()).map_err(|e| {
                Error::Decode(format!("{} is not valid UTF-8: {}", schema.name, e))
            })
        }
    }
}

/// Canonical display form a value takes after an encode/decode round trip.
pub fn canonical(schema: &FieldSchema, value: &str) -> std::result::Result<String, ValidationError> {
    let encoded = encode(schema, value)?;
    decode(schema, &encoded).map_err(|e| ValidationError::InvalidValue {
        field: schema.name.clone(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_int(schema: &FieldSchema, value: &str) -> std::result::Result<i64, ValidationError> {
    value
        .parse::<i64>()
        .map_err(|e| ValidationError::InvalidValue {
            field: schema.name.clone(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn check_range(
    schema: &FieldSchema,
    value: i64,
    type_min: i64,
    type_max: i64,
) -> std::result::Result<(), ValidationError> {
    let min = schema.min.map_or(type_min, |m| m.max(type_min));
    let max = schema.max.map_or(type_max, |m| m.min(type_max));

    let bound = if value < min {
        Some(RangeBound::Min(min))
    } else if value > max {
        Some(RangeBound::Max(max))
    } else {
        None
    };

    match bound {
        Some(bound) => Err(ValidationError::OutOfRange {
            field: schema.name.clone(),
            value,
            bound,
        }),
        None => Ok(()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn take<const N: usize>(schema: &FieldSchema, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| {
            Error::Decode(format!(
                "{} expects {} bytes, got {}",
                schema.name,
                N,
                bytes.len()
            ))
        })
}
