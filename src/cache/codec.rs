//! On-disk encoding of cached responses.
//!
//! Entries are JSON documents. Keys are derived from the operation name and a
//! canonical rendering of the arguments, so argument order never changes the
//! file an entry lands in.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

pub const ENTRY_EXTENSION: &str = "cache";

/// Render a value as JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Content hash of an operation and its arguments (hex sha256).
pub fn content_hash(operation: &str, args: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(&Value::Object(args.clone())).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// File name for an entry: `<operation>-<16 hex chars>.cache`.
pub fn entry_file_name(operation: &str, args: &Map<String, Value>) -> String {
    let safe_operation: String = operation
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let hash = content_hash(operation, args);
    format!("{safe_operation}-{}.{ENTRY_EXTENSION}", &hash[..16])
}

/// Normalize a response before it is cached or handed to callers.
///
/// Timestamps become UTC ISO-8601 strings truncated to whole seconds, and
/// floats without a fractional part become integers.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::String(
                dt.with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            Err(_) => Value::String(s),
        },
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect(),
        ),
        other => other,
    }
}

fn normalize_number(n: Number) -> Number {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Number::from(f as i64)
        }
        _ => n,
    }
}

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    Ok(simd_json::to_vec(value)?)
}

pub fn decode(bytes: &mut [u8]) -> Result<Value> {
    Ok(simd_json::from_slice(bytes)?)
}
