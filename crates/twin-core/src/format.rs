//! Rendering stored values as display strings.

use serde_json::Value;

/// Format a stored value of mixed native type.
///
/// Integers render as plain decimal, floats as the shortest decimal that
/// round-trips (never in exponent form), strings unquoted. Null renders as an
/// empty string; arrays and objects render as JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(format_float).unwrap_or_else(|| n.to_string())
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_float(f: f64) -> String {
    // Display for f64 is the shortest round-trip form without an exponent
    format!("{}", f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_integers() {
        assert_eq!(format_value(&json!(2500)), "2500");
        assert_eq!(format_value(&json!(-12)), "-12");
        assert_eq!(format_value(&json!(u64::MAX)), "18446744073709551615");
    }

    #[test]
    fn test_format_floats() {
        assert_eq!(format_value(&json!(2.5)), "2.5");
        assert_eq!(format_value(&json!(3000.0)), "3000");
        assert_eq!(format_value(&json!(0.1)), "0.1");
        assert_eq!(format_value(&json!(1e21)), "1000000000000000000000");
    }

    #[test]
    fn test_format_other_values() {
        assert_eq!(format_value(&json!("rupert")), "rupert");
        assert_eq!(format_value(&json!(true)), "true");
        assert_eq!(format_value(&Value::Null), "");
    }
}
