//! JSON Canonicalization (RFC 8785 / JCS)
//!
//! Anchors, audit entries, commitment records and signed envelopes are all
//! hashed or signed over their canonical JSON form, so two independent
//! serializations of the same logical value always produce the same bytes.

use crate::errors::{AgidError, AgidResult};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Canonicalize a JSON value: sorted object keys, no insignificant whitespace.
pub fn canonicalize_json(value: &Value) -> AgidResult<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Serialize any value and return its canonical bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> AgidResult<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| AgidError::serialization("canonical form", e))?;
    Ok(canonicalize_json(&value)?.into_bytes())
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of the canonical form of a value.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> AgidResult<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

fn write_value(value: &Value, out: &mut String) -> AgidResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                // writing to a String cannot fail
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ECMAScript number formatting for the values serde_json can hold.
fn write_number(num: &serde_json::Number, out: &mut String) -> AgidResult<()> {
    if let Some(i) = num.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = num.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = num.as_f64() {
        if !f.is_finite() {
            return Err(AgidError::validation("number", "non-finite numbers are not canonical"));
        }
        if f.fract() == 0.0 && f.abs() < 1e15 {
            let _ = write!(out, "{}", f as i64);
        } else {
            let _ = write!(out, "{f}");
        }
    } else {
        return Err(AgidError::validation("number", "unrepresentable number"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_keys_sorted_recursively() {
        let input = json!({
            "outer": {"z": 1, "a": {"c": 3, "b": 2}},
            "first": 1
        });
        assert_eq!(
            canonicalize_json(&input).unwrap(),
            r#"{"first":1,"outer":{"a":{"b":2,"c":3},"z":1}}"#
        );
    }

    #[test]
    fn test_arrays_keep_order() {
        let input = json!({"array": [3, 1, 2], "another": ["z", "a"]});
        assert_eq!(
            canonicalize_json(&input).unwrap(),
            r#"{"another":["z","a"],"array":[3,1,2]}"#
        );
    }

    #[test]
    fn test_numbers_and_escapes() {
        let input = json!({"whole": 5.0, "float": 3.25, "text": "a\"b\nc\u{1}"});
        assert_eq!(
            canonicalize_json(&input).unwrap(),
            r#"{"float":3.25,"text":"a\"b\nc\u0001","whole":5}"#
        );
    }

    #[test]
    fn test_struct_and_map_serializations_hash_identically() {
        #[derive(Serialize)]
        struct Sample {
            b: u32,
            a: &'static str,
        }
        let from_struct = canonical_hash(&Sample { b: 7, a: "x" }).unwrap();
        let from_value = canonical_hash(&json!({"a": "x", "b": 7})).unwrap();
        assert_eq!(from_struct, from_value);
    }
}
