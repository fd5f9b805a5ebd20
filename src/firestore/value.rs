//! Conversion between Firestore typed values and plain JSON.
//!
//! Firestore's REST API wraps every field in a typed envelope
//! (`{"stringValue": "..."}`, `{"timestampValue": "..."}`, ...). Records handed
//! to the rest of the app are plain JSON; timestamps become epoch millis.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};

/// A document as returned by the REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
  /// Full resource name: `projects/{p}/databases/{d}/documents/{collection}/{id}`
  pub name: String,
  #[serde(default)]
  pub fields: Map<String, Value>,
}

impl Document {
  /// The last path segment of the resource name.
  pub fn id(&self) -> &str {
    self.name.rsplit('/').next().unwrap_or(&self.name)
  }

  /// Plain JSON record with the document id under `"id"`.
  pub fn into_record(self) -> Map<String, Value> {
    let id = self.id().to_string();
    let mut record = decode_fields(&self.fields);
    record.insert("id".to_string(), Value::String(id));
    record
  }
}

/// Decode a `fields` map.
pub fn decode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
  fields
    .iter()
    .map(|(k, v)| (k.clone(), decode_value(v)))
    .collect()
}

/// Decode one typed value. Unknown envelopes decode to `null`.
pub fn decode_value(value: &Value) -> Value {
  let Some(envelope) = value.as_object() else {
    return Value::Null;
  };
  let Some((kind, inner)) = envelope.iter().next() else {
    return Value::Null;
  };

  match kind.as_str() {
    "nullValue" => Value::Null,
    "booleanValue" => inner.clone(),
    // 64-bit integers travel as strings
    "integerValue" => match inner {
      Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
      other => other.clone(),
    },
    "doubleValue" => inner.clone(),
    "timestampValue" => inner
      .as_str()
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|dt| Value::from(dt.timestamp_millis()))
      .unwrap_or(Value::Null),
    "stringValue" | "bytesValue" | "referenceValue" => inner.clone(),
    "geoPointValue" => json!({
      "latitude": inner.get("latitude").cloned().unwrap_or(Value::Null),
      "longitude": inner.get("longitude").cloned().unwrap_or(Value::Null),
    }),
    "arrayValue" => Value::Array(
      inner
        .get("values")
        .and_then(Value::as_array)
        .map(|values| values.iter().map(decode_value).collect())
        .unwrap_or_default(),
    ),
    "mapValue" => Value::Object(
      inner
        .get("fields")
        .and_then(Value::as_object)
        .map(decode_fields)
        .unwrap_or_default(),
    ),
    _ => Value::Null,
  }
}

/// Encode a plain JSON record as a `fields` map.
pub fn encode_fields(record: &Map<String, Value>) -> Map<String, Value> {
  record
    .iter()
    .map(|(k, v)| (k.clone(), encode_value(v)))
    .collect()
}

/// Encode one plain value.
pub fn encode_value(value: &Value) -> Value {
  match value {
    Value::Null => json!({ "nullValue": null }),
    Value::Bool(b) => json!({ "booleanValue": b }),
    Value::Number(n) => encode_number(n),
    Value::String(s) => json!({ "stringValue": s }),
    Value::Array(items) => json!({
      "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
    }),
    Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
  }
}

fn encode_number(n: &Number) -> Value {
  match n.as_i64() {
    Some(i) => json!({ "integerValue": i.to_string() }),
    None => json!({ "doubleValue": n.as_f64() }),
  }
}

/// The current client time as a typed timestamp.
pub fn timestamp_now() -> Value {
  json!({ "timestampValue": chrono::Utc::now().to_rfc3339() })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decode_document() {
    let doc: Document = serde_json::from_value(json!({
      "name": "projects/p/databases/(default)/documents/pets/p1",
      "fields": {
        "name": { "stringValue": "Mochi" },
        "age": { "integerValue": "3" },
        "weight": { "doubleValue": 4.2 },
        "neutered": { "booleanValue": true },
        "createdAt": { "timestampValue": "2024-01-01T00:00:00.250Z" },
        "tags": { "arrayValue": { "values": [{ "stringValue": "indoor" }] } },
        "vet": { "mapValue": { "fields": { "phone": { "nullValue": null } } } },
        "empty": { "arrayValue": {} }
      }
    }))
    .unwrap();

    assert_eq!(doc.id(), "p1");
    assert_eq!(
      Value::Object(doc.into_record()),
      json!({
        "id": "p1",
        "name": "Mochi",
        "age": 3,
        "weight": 4.2,
        "neutered": true,
        "createdAt": 1_704_067_200_250_i64,
        "tags": ["indoor"],
        "vet": { "phone": null },
        "empty": []
      })
    );
  }

  #[test]
  fn test_encode_value() {
    assert_eq!(
      encode_value(&json!({ "n": 2, "x": 1.5, "s": "a", "l": [true] })),
      json!({ "mapValue": { "fields": {
        "n": { "integerValue": "2" },
        "x": { "doubleValue": 1.5 },
        "s": { "stringValue": "a" },
        "l": { "arrayValue": { "values": [{ "booleanValue": true }] } }
      } } })
    );
  }
}
