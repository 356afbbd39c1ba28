//! RFC 8785 JSON Canonicalization Scheme (JCS) and SHA-256 hashing over the
//! resulting bytes.
//!
//! Object keys are sorted by UTF-16 code unit order, numbers use the
//! canonical ECMAScript `Number::toString` form, and strings use the
//! shortest valid escaping. The output is deterministic for any two
//! logically-equal `serde_json::Value`s.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("value is not representable in canonical JSON: {0}")]
    Unrepresentable(String),
}

/// Produce RFC 8785 canonical bytes for `value`.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out.into_bytes())
}

/// SHA-256 digest of `bytes`.
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Convenience: canonicalize then hash in one call.
pub fn canonical_hash(value: &Value) -> Result<([u8; 32], Vec<u8>), CanonicalError> {
    let bytes = canonicalize(value)?;
    Ok((hash(&bytes), bytes))
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        Value::Null => {
            out.push_str("null");
            Ok(())
        }
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Number(n) => write_number(n, out),
        Value::String(s) => {
            write_string(s, out);
            Ok(())
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
            Ok(())
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[*key], out)?;
            }
            out.push('}');
            Ok(())
        }
    }
}

fn write_number(n: &Number, out: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| CanonicalError::Unrepresentable("number out of range".to_string()))?;
    if !f.is_finite() {
        return Err(CanonicalError::Unrepresentable(
            "non-finite number".to_string(),
        ));
    }
    out.push_str(&format_canonical_f64(f));
    Ok(())
}

/// ECMAScript-style shortest round-tripping decimal representation, which is
/// what RFC 8785 mandates for non-integer numbers.
fn format_canonical_f64(f: f64) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() {
            "-0".to_string()
        } else {
            "0".to_string()
        };
    }
    let mut repr = format!("{f}");
    if let Some(idx) = repr.find('e') {
        // Rust's `{}` formatting never emits exponents for f64 in the ranges
        // we accept here, but guard defensively by normalizing to lowercase.
        repr.replace_range(idx..idx + 1, "e");
    }
    repr
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Structural equality between two values irrespective of key order or
/// whitespace, used to enforce that `payload_canonical` semantically matches
/// `payload_json` (§4.2 precondition 2, §4.7 check 4).
pub fn semantically_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(m1), Value::Object(m2)) => {
            if m1.len() != m2.len() {
                return false;
            }
            m1.iter()
                .all(|(k, v)| m2.get(k).is_some_and(|v2| semantically_equal(v, v2)))
        }
        (Value::Array(a1), Value::Array(a2)) => {
            a1.len() == a2.len()
                && a1
                    .iter()
                    .zip(a2.iter())
                    .all(|(x, y)| semantically_equal(x, y))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let value = json!({"z": {"b": 1, "a": 2}, "a": 1});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":1,"z":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn integers_have_no_decimal_point() {
        let value = json!({"n": 42});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"n":42}"#);
    }

    #[test]
    fn strings_escape_control_characters() {
        let value = Value::String("line\nbreak\t\"quote\"".to_string());
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#""line\nbreak\t\"quote\"""#
        );
    }

    #[test]
    fn hash_is_stable_for_equal_values() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        let (h1, _) = canonical_hash(&a).unwrap();
        let (h2, _) = canonical_hash(&b).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn semantic_equality_ignores_key_order() {
        let a = json!({"a": 1, "b": [1, 2, {"x": true}]});
        let b = json!({"b": [1, 2, {"x": true}], "a": 1});
        assert!(semantically_equal(&a, &b));
    }

    #[test]
    fn semantic_equality_detects_tamper() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert!(!semantically_equal(&a, &b));
    }
}
