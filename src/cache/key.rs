//! Cache key derivation.
//!
//! A key is the endpoint identifier followed by a SHA256 digest of the
//! canonical JSON form of the arguments. Canonical means object members are
//! written in sorted key order, so `{"a":1,"b":2}` and `{"b":2,"a":1}` produce
//! the same key.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Deepest argument nesting accepted before a value is treated as
/// self-referential.
pub const MAX_ARGUMENT_DEPTH: usize = 64;

/// Failure to derive a key from an argument value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
  #[error("argument for endpoint `{endpoint}` has no canonical serialization: {reason}")]
  UnserializableArgument { endpoint: String, reason: String },
}

/// Opaque identifier of one (endpoint, arguments) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Endpoint identifier this key was derived from.
  pub fn endpoint(&self) -> &str {
    self
      .0
      .rsplit_once('#')
      .map(|(endpoint, _)| endpoint)
      .unwrap_or(&self.0)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Derive the cache key for `endpoint` called with `args`.
pub fn compute_key<A>(endpoint: &str, args: &A) -> Result<CacheKey, KeyError>
where
  A: Serialize + ?Sized,
{
  let unserializable = |reason: String| KeyError::UnserializableArgument {
    endpoint: endpoint.to_string(),
    reason,
  };

  let value = serde_json::to_value(args).map_err(|e| unserializable(e.to_string()))?;
  let canonical = canonical_json(&value).map_err(unserializable)?;

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(endpoint.as_bytes());
  hasher.update([0u8]);
  hasher.update(canonical.as_bytes());
  let digest = hex::encode(hasher.finalize());

  Ok(CacheKey(format!("{}#{}", endpoint, digest)))
}

/// Render `value` as JSON with object members in sorted key order.
pub fn canonical_json(value: &Value) -> Result<String, String> {
  let mut out = String::new();
  write_canonical(value, 0, &mut out)?;
  Ok(out)
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) -> Result<(), String> {
  if depth > MAX_ARGUMENT_DEPTH {
    return Err(format!(
      "nesting exceeds {} levels (cyclic value?)",
      MAX_ARGUMENT_DEPTH
    ));
  }

  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    Value::Number(n) => out.push_str(&n.to_string()),
    Value::String(s) => push_string(s, out),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, depth + 1, out)?;
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut members: Vec<(&String, &Value)> = map.iter().collect();
      members.sort_by(|a, b| a.0.cmp(b.0));

      out.push('{');
      for (i, (name, member)) in members.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        push_string(name, out);
        out.push(':');
        write_canonical(member, depth + 1, out)?;
      }
      out.push('}');
    }
  }

  Ok(())
}

fn push_string(s: &str, out: &mut String) {
  // Serializing a str cannot fail
  out.push_str(&Value::String(s.to_string()).to_string());
}
