//! Wire codec for serialized diffs
//!
//! A diff travels as a three-element array `[key, tag, payload]`. Composite
//! payloads are arrays of nested three-element arrays, recursively, so the
//! receiver needs no schema to decode them.

use crate::diff::{Payload, SerializedDiff, VariantTag};
use crate::key::Key;
use crate::value::Value;

/// Errors produced while decoding diffs
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Tag not produced by any known encoder
    #[error("unknown variant tag: {0}")]
    UnknownVariant(String),

    /// Structure does not match the tag
    #[error("malformed diff: {0}")]
    Malformed(String),

    /// Text/bytes are not valid JSON for a diff
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether this is the forward-compatibility failure for unknown tags
    #[inline]
    #[must_use]
    pub fn is_unknown_variant(&self) -> bool {
        matches!(self, Self::UnknownVariant(_))
    }
}

/// Encode a diff into its wire value
#[must_use]
pub fn encode(diff: &SerializedDiff) -> Value {
    let key = match diff.key() {
        None => Value::Nil,
        Some(Key::Name(name)) => Value::String(name.clone()),
        #[allow(clippy::cast_precision_loss)]
        Some(Key::Index(index)) => Value::Number(*index as f64),
    };
    let payload = match diff.payload() {
        Payload::Value(value) => value.clone(),
        Payload::Entries(entries) => Value::Array(entries.iter().map(encode).collect()),
    };
    Value::Array(vec![key, Value::String(diff.tag().as_str().to_string()), payload])
}

/// Decode a wire value into a diff
///
/// # Errors
/// - [`CodecError::UnknownVariant`] for an unrecognized tag, at any depth
/// - [`CodecError::Malformed`] if the structure does not match the tag
pub fn decode(wire: Value) -> Result<SerializedDiff, CodecError> {
    let Value::Array(parts) = wire else {
        return Err(CodecError::Malformed(format!(
            "expected [key, tag, payload], got {}",
            wire.kind()
        )));
    };
    let [key, tag, payload]: [Value; 3] = parts.try_into().map_err(|parts: Vec<Value>| {
        CodecError::Malformed(format!("expected 3 elements, got {}", parts.len()))
    })?;

    let key = decode_key(key)?;
    let tag = match tag {
        Value::String(name) => name.parse::<VariantTag>()?,
        other => {
            return Err(CodecError::Malformed(format!(
                "tag must be a string, got {}",
                other.kind()
            )))
        }
    };

    if !tag.is_composite() {
        return Ok(SerializedDiff::value(key, payload));
    }

    let Value::Array(items) = payload else {
        return Err(CodecError::Malformed(format!(
            "{tag} payload must be a list of entries, got {}",
            payload.kind()
        )));
    };
    let entries = items
        .into_iter()
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    SerializedDiff::composite(key, tag, entries)
}

fn decode_key(key: Value) -> Result<Option<Key>, CodecError> {
    match key {
        Value::Nil => Ok(None),
        Value::String(name) => Ok(Some(Key::Name(name))),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) => {
            Ok(Some(Key::Index(n as usize)))
        }
        other => Err(CodecError::Malformed(format!("invalid key: {other}"))),
    }
}

/// Encode a diff as JSON text
///
/// # Errors
/// Returns error if JSON serialization fails
pub fn to_json(diff: &SerializedDiff) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&encode(diff))?)
}

/// Decode a diff from JSON text
///
/// # Errors
/// Returns error for invalid JSON or an invalid diff
pub fn from_json(text: &str) -> Result<SerializedDiff, CodecError> {
    let wire: Value = serde_json::from_str(text)?;
    decode(wire)
}

impl From<SerializedDiff> for Value {
    fn from(diff: SerializedDiff) -> Self {
        encode(&diff)
    }
}

impl TryFrom<Value> for SerializedDiff {
    type Error = CodecError;

    fn try_from(wire: Value) -> Result<Self, Self::Error> {
        decode(wire)
    }
}
