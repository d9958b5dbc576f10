//! Hash utilities for content-addressed identity (SHA-256 over canonical JSON).
//! Canonical form: keys sorted lexicographically at every level, no whitespace,
//! UTF-8 passed through unescaped. Determinism is required across platforms.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Minimum prefix length accepted by commit resolution.
pub const MIN_PREFIX_LEN: usize = 4;

/// Serialize a JSON tree to its canonical textual form.
///
/// Object keys are sorted by Unicode code point at every nesting level,
/// separators carry no whitespace, and strings are escaped only where JSON
/// requires it (non-ASCII characters pass through as UTF-8). Two trees that
/// are structurally equal always canonicalize to the same bytes, regardless
/// of the key order or whitespace of their source form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // Scalar serialization cannot fail.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Minimal JSON string escaping: quotes, backslash, and control characters.
/// Everything else, including non-ASCII, is emitted verbatim.
fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// SHA-256 over the canonical JSON of `payload`, hex-encoded.
///
/// The payload must be a plain JSON tree; this is the identity function for
/// blobs and tool schemas.
pub fn content_hash(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Compute a commit's identity hash.
///
/// The hash covers exactly: the blob hash, the primary parent, the sorted
/// extra parents, the content type, the operation name, the identity
/// timestamp, and the edit target. `None` fields and an empty extra-parent
/// list are omitted from the hashed record, so `edit_target: None` hashes
/// identically to an absent field. Fields such as `message`, `metadata`, and
/// `token_count` are deliberately not part of identity.
#[allow(clippy::too_many_arguments)]
pub fn commit_hash(
    content_hash: &str,
    parent_hash: Option<&str>,
    extra_parents: &[String],
    content_type: &str,
    operation: &str,
    timestamp_iso: &str,
    edit_target: Option<&str>,
) -> String {
    let mut record = serde_json::Map::new();
    record.insert("content_hash".to_string(), Value::from(content_hash));
    if let Some(parent) = parent_hash {
        record.insert("parent_hash".to_string(), Value::from(parent));
    }
    if !extra_parents.is_empty() {
        let mut sorted = extra_parents.to_vec();
        sorted.sort();
        record.insert("extra_parents".to_string(), Value::from(sorted));
    }
    record.insert("content_type".to_string(), Value::from(content_type));
    record.insert("operation".to_string(), Value::from(operation));
    record.insert("timestamp".to_string(), Value::from(timestamp_iso));
    if let Some(target) = edit_target {
        record.insert("edit_target".to_string(), Value::from(target));
    }
    sha256_hex(canonical_json(&Value::Object(record)).as_bytes())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
