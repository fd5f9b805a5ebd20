//! Lossy JSON conversion used when a value cannot be serialized as-is.
//!
//! The serializer never gives up on a nested part: map keys that are not
//! strings are stringified, non-finite floats become `null`, and any element
//! or field whose `Serialize` impl errors is replaced by `null`. Only a failure
//! at the top level is reported.

use serde::ser::{self, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt::Display;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct LossyError(String);

impl ser::Error for LossyError {
  fn custom<T: Display>(msg: T) -> Self {
    LossyError(msg.to_string())
  }
}

/// Convert any serializable value into plain JSON, dropping what cannot be kept.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, LossyError> {
  value.serialize(LossySerializer)
}

/// Replace timestamp-shaped objects with epoch millis, recursively.
///
/// Recognizes `{seconds, nanoseconds}` and `{_seconds, _nanoseconds}`.
pub fn normalize_timestamps(value: Value) -> Value {
  match value {
    Value::Array(items) => Value::Array(items.into_iter().map(normalize_timestamps).collect()),
    Value::Object(map) => match timestamp_millis(&map) {
      Some(millis) => Value::from(millis),
      None => Value::Object(
        map
          .into_iter()
          .map(|(k, v)| (k, normalize_timestamps(v)))
          .collect(),
      ),
    },
    other => other,
  }
}

fn timestamp_millis(map: &Map<String, Value>) -> Option<i64> {
  if map.len() != 2 {
    return None;
  }
  let (seconds, nanos) = match (map.get("seconds"), map.get("nanoseconds")) {
    (Some(s), Some(n)) => (s, n),
    _ => (map.get("_seconds")?, map.get("_nanoseconds")?),
  };
  seconds
    .as_i64()?
    .checked_mul(1000)?
    .checked_add(nanos.as_i64()? / 1_000_000)
}

fn lossy<T: Serialize + ?Sized>(value: &T) -> Value {
  value.serialize(LossySerializer).unwrap_or(Value::Null)
}

fn key_string(key: Value) -> String {
  match key {
    Value::String(s) => s,
    other => other.to_string(),
  }
}

struct LossySerializer;

impl ser::Serializer for LossySerializer {
  type Ok = Value;
  type Error = LossyError;

  type SerializeSeq = SeqBuilder;
  type SerializeTuple = SeqBuilder;
  type SerializeTupleStruct = SeqBuilder;
  type SerializeTupleVariant = VariantSeqBuilder;
  type SerializeMap = MapBuilder;
  type SerializeStruct = MapBuilder;
  type SerializeStructVariant = VariantMapBuilder;

  fn serialize_bool(self, v: bool) -> Result<Value, LossyError> {
    Ok(Value::Bool(v))
  }

  fn serialize_i8(self, v: i8) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_i16(self, v: i16) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_i32(self, v: i32) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_i64(self, v: i64) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_i128(self, v: i128) -> Result<Value, LossyError> {
    Ok(match i64::try_from(v) {
      Ok(small) => Value::from(small),
      Err(_) => Value::String(v.to_string()),
    })
  }

  fn serialize_u8(self, v: u8) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_u16(self, v: u16) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_u32(self, v: u32) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_u64(self, v: u64) -> Result<Value, LossyError> {
    Ok(Value::from(v))
  }

  fn serialize_u128(self, v: u128) -> Result<Value, LossyError> {
    Ok(match u64::try_from(v) {
      Ok(small) => Value::from(small),
      Err(_) => Value::String(v.to_string()),
    })
  }

  fn serialize_f32(self, v: f32) -> Result<Value, LossyError> {
    self.serialize_f64(f64::from(v))
  }

  fn serialize_f64(self, v: f64) -> Result<Value, LossyError> {
    Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
  }

  fn serialize_char(self, v: char) -> Result<Value, LossyError> {
    Ok(Value::String(v.to_string()))
  }

  fn serialize_str(self, v: &str) -> Result<Value, LossyError> {
    Ok(Value::String(v.to_owned()))
  }

  fn serialize_bytes(self, v: &[u8]) -> Result<Value, LossyError> {
    Ok(Value::Array(v.iter().map(|b| Value::from(*b)).collect()))
  }

  fn serialize_none(self) -> Result<Value, LossyError> {
    Ok(Value::Null)
  }

  fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, LossyError> {
    value.serialize(self)
  }

  fn serialize_unit(self) -> Result<Value, LossyError> {
    Ok(Value::Null)
  }

  fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, LossyError> {
    Ok(Value::Null)
  }

  fn serialize_unit_variant(
    self,
    _name: &'static str,
    _index: u32,
    variant: &'static str,
  ) -> Result<Value, LossyError> {
    Ok(Value::String(variant.to_owned()))
  }

  fn serialize_newtype_struct<T: Serialize + ?Sized>(
    self,
    _name: &'static str,
    value: &T,
  ) -> Result<Value, LossyError> {
    value.serialize(self)
  }

  fn serialize_newtype_variant<T: Serialize + ?Sized>(
    self,
    _name: &'static str,
    _index: u32,
    variant: &'static str,
    value: &T,
  ) -> Result<Value, LossyError> {
    let mut map = Map::new();
    map.insert(variant.to_owned(), lossy(value));
    Ok(Value::Object(map))
  }

  fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, LossyError> {
    Ok(SeqBuilder {
      items: Vec::with_capacity(len.unwrap_or(0)),
    })
  }

  fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, LossyError> {
    self.serialize_seq(Some(len))
  }

  fn serialize_tuple_struct(
    self,
    _name: &'static str,
    len: usize,
  ) -> Result<SeqBuilder, LossyError> {
    self.serialize_seq(Some(len))
  }

  fn serialize_tuple_variant(
    self,
    _name: &'static str,
    _index: u32,
    variant: &'static str,
    len: usize,
  ) -> Result<VariantSeqBuilder, LossyError> {
    Ok(VariantSeqBuilder {
      variant,
      items: Vec::with_capacity(len),
    })
  }

  fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, LossyError> {
    Ok(MapBuilder {
      map: Map::new(),
      next_key: None,
    })
  }

  fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapBuilder, LossyError> {
    self.serialize_map(Some(len))
  }

  fn serialize_struct_variant(
    self,
    _name: &'static str,
    _index: u32,
    variant: &'static str,
    _len: usize,
  ) -> Result<VariantMapBuilder, LossyError> {
    Ok(VariantMapBuilder {
      variant,
      map: Map::new(),
    })
  }
}

struct SeqBuilder {
  items: Vec<Value>,
}

impl ser::SerializeSeq for SeqBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), LossyError> {
    self.items.push(lossy(value));
    Ok(())
  }

  fn end(self) -> Result<Value, LossyError> {
    Ok(Value::Array(self.items))
  }
}

impl ser::SerializeTuple for SeqBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), LossyError> {
    ser::SerializeSeq::serialize_element(self, value)
  }

  fn end(self) -> Result<Value, LossyError> {
    ser::SerializeSeq::end(self)
  }
}

impl ser::SerializeTupleStruct for SeqBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), LossyError> {
    ser::SerializeSeq::serialize_element(self, value)
  }

  fn end(self) -> Result<Value, LossyError> {
    ser::SerializeSeq::end(self)
  }
}

struct VariantSeqBuilder {
  variant: &'static str,
  items: Vec<Value>,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), LossyError> {
    self.items.push(lossy(value));
    Ok(())
  }

  fn end(self) -> Result<Value, LossyError> {
    let mut map = Map::new();
    map.insert(self.variant.to_owned(), Value::Array(self.items));
    Ok(Value::Object(map))
  }
}

struct MapBuilder {
  map: Map<String, Value>,
  /// `None` after a key that could not be serialized; its value is skipped
  next_key: Option<String>,
}

impl ser::SerializeMap for MapBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), LossyError> {
    self.next_key = key.serialize(LossySerializer).ok().map(key_string);
    Ok(())
  }

  fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), LossyError> {
    if let Some(key) = self.next_key.take() {
      self.map.insert(key, lossy(value));
    }
    Ok(())
  }

  fn end(self) -> Result<Value, LossyError> {
    Ok(Value::Object(self.map))
  }
}

impl ser::SerializeStruct for MapBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_field<T: Serialize + ?Sized>(
    &mut self,
    key: &'static str,
    value: &T,
  ) -> Result<(), LossyError> {
    self.map.insert(key.to_owned(), lossy(value));
    Ok(())
  }

  fn end(self) -> Result<Value, LossyError> {
    Ok(Value::Object(self.map))
  }
}

struct VariantMapBuilder {
  variant: &'static str,
  map: Map<String, Value>,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
  type Ok = Value;
  type Error = LossyError;

  fn serialize_field<T: Serialize + ?Sized>(
    &mut self,
    key: &'static str,
    value: &T,
  ) -> Result<(), LossyError> {
    self.map.insert(key.to_owned(), lossy(value));
    Ok(())
  }

  fn end(self) -> Result<Value, LossyError> {
    let mut outer = Map::new();
    outer.insert(self.variant.to_owned(), Value::Object(self.map));
    Ok(Value::Object(outer))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::BTreeMap;

  struct Broken;

  impl Serialize for Broken {
    fn serialize<S: ser::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
      Err(ser::Error::custom("not serializable"))
    }
  }

  #[derive(serde::Serialize)]
  struct Record {
    name: &'static str,
    handle: Broken,
    weight: f64,
  }

  #[test]
  fn test_tuple_keys_are_stringified() {
    let mut map = BTreeMap::new();
    map.insert((1, 2), "a");
    assert!(serde_json::to_value(&map).is_err());

    assert_eq!(to_value(&map).unwrap(), json!({ "[1,2]": "a" }));
  }

  #[test]
  fn test_broken_fields_become_null() {
    let record = Record {
      name: "Mochi",
      handle: Broken,
      weight: f64::NAN,
    };
    assert_eq!(
      to_value(&record).unwrap(),
      json!({ "name": "Mochi", "handle": null, "weight": null })
    );
  }

  #[test]
  fn test_broken_top_level_is_an_error() {
    assert!(to_value(&Broken).is_err());
  }

  #[test]
  fn test_normalize_timestamps() {
    let value = json!({
      "createdAt": { "seconds": 1_700_000_000, "nanoseconds": 5_000_000 },
      "nested": [{ "_seconds": 1, "_nanoseconds": 0 }],
      "notATimestamp": { "seconds": 1, "nanoseconds": 0, "extra": true },
    });

    assert_eq!(
      normalize_timestamps(value),
      json!({
        "createdAt": 1_700_000_000_005_i64,
        "nested": [1000],
        "notATimestamp": { "seconds": 1, "nanoseconds": 0, "extra": true },
      })
    );
  }

  #[test]
  fn test_out_of_range_timestamp_is_kept_as_is() {
    let value = json!({ "seconds": i64::MAX / 10, "nanoseconds": 0 });
    assert_eq!(normalize_timestamps(value.clone()), value);
  }
}
