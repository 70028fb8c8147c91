//! Content fingerprinting for events.
//!
//! The fingerprint is the SHA-256 of `"{event_type}:{canonical_json}"` in
//! lowercase hex. Canonical JSON sorts object keys by code point at every
//! nesting level and separates items with `", "` and keys from values with
//! `": "`, with non-ASCII text written verbatim. That layout is the one the
//! existing producers hash with, so fingerprints of stored events stay
//! comparable.

use std::io;

use serde::{ser::SerializeMap, ser::SerializeSeq, Serialize, Serializer};
use serde_json::{ser::Formatter, Value};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    models::EventHash,
};

/// Converts a serializable payload into event data.
///
/// # Errors
///
/// Returns `Error::Validation` if the payload cannot be represented as JSON
/// (for example a map with non-string keys) or is not a JSON object.
pub fn to_event_data<T>(data: &T) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(data).map_err(|e| {
        Error::validation(format!("Invalid event_data: cannot be converted to JSON - {e}"))
    })?;
    ensure_object(&value)?;
    Ok(value)
}

/// Checks that event data is a JSON object.
///
/// # Errors
///
/// Returns `Error::Validation` naming the actual JSON type otherwise.
pub fn ensure_object(value: &Value) -> Result<()> {
    if value.is_object() {
        return Ok(());
    }
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    Err(Error::validation(format!("Invalid event_data: expected a JSON object, got {kind}")))
}

/// Renders a JSON value in canonical form.
///
/// # Errors
///
/// Returns `Error::Validation` if serialization fails, which cannot happen
/// for values built by `serde_json` itself.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut buf = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    Canonical(value)
        .serialize(&mut serializer)
        .map_err(|e| Error::validation(format!("Invalid event_data: {e}")))?;
    String::from_utf8(buf).map_err(|e| Error::validation(format!("Invalid event_data: {e}")))
}

/// Computes the content fingerprint of an event.
///
/// # Errors
///
/// Returns `Error::Validation` if `event_data` is not a JSON object.
pub fn event_hash(event_type: &str, event_data: &Value) -> Result<EventHash> {
    ensure_object(event_data)?;
    let canonical = canonical_json(event_data)?;

    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());

    Ok(EventHash::new(hex::encode(hasher.finalize())))
}

/// Serializes a value with object keys sorted, independent of whether
/// `serde_json` was built with `preserve_order`.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            },
            Value::Array(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&Canonical(item))?;
                }
                out.end()
            },
            scalar => scalar.serialize(serializer),
        }
    }
}

/// Compact JSON with a space after `,` and `:`.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
