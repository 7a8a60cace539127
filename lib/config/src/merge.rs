use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Merge `source` over `target`, field by field.
///
/// - When both sides hold an object and `merge_nested` is set,
///   the objects merge recursively; otherwise source replaces.
/// - When both sides hold an array and `extend_array` is set,
///   the source array is appended; otherwise source replaces.
/// - A type mismatch on an object / array field is an error.
pub fn merge_objects(
  mut target: JsonObject,
  source: JsonObject,
  merge_nested: bool,
  extend_array: bool,
) -> Result<JsonObject> {
  for (key, incoming) in source {
    let Some(existing) = target.remove(&key) else {
      target.insert(key, incoming);
      continue;
    };
    let merged = match existing {
      serde_json::Value::Object(existing_obj)
        if merge_nested =>
      {
        match incoming {
          serde_json::Value::Object(incoming_obj) => {
            serde_json::Value::Object(merge_objects(
              existing_obj,
              incoming_obj,
              merge_nested,
              extend_array,
            )?)
          }
          value => {
            return Err(Error::ObjectFieldTypeMismatch {
              key,
              value,
            });
          }
        }
      }
      serde_json::Value::Array(mut existing_arr)
        if extend_array =>
      {
        match incoming {
          serde_json::Value::Array(incoming_arr) => {
            existing_arr.extend(incoming_arr);
            serde_json::Value::Array(existing_arr)
          }
          value => {
            return Err(Error::ArrayFieldTypeMismatch {
              key,
              value,
            });
          }
        }
      }
      _ => incoming,
    };
    target.insert(key, merged);
  }
  Ok(target)
}

/// Merge two configuration values of the same type, source
/// overriding target.
pub fn merge_config<T: Serialize + DeserializeOwned>(
  target: T,
  source: T,
  merge_nested: bool,
  extend_array: bool,
) -> Result<T> {
  let target = to_object(target)?;
  let source = to_object(source)?;
  let merged =
    merge_objects(target, source, merge_nested, extend_array)?;
  serde_json::from_value(serde_json::Value::Object(merged))
    .map_err(|e| Error::ParseFinalJson { e })
}

fn to_object<T: Serialize>(value: T) -> Result<JsonObject> {
  match serde_json::to_value(value)
    .map_err(|e| Error::SerializeJson { e })?
  {
    serde_json::Value::Object(object) => Ok(object),
    _ => Err(Error::ValueIsNotObject),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn obj(value: serde_json::Value) -> JsonObject {
    match value {
      serde_json::Value::Object(object) => object,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn source_overrides_scalars() {
    let merged = merge_objects(
      obj(json!({ "a": 1, "b": "x" })),
      obj(json!({ "b": "y", "c": true })),
      true,
      false,
    )
    .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      json!({ "a": 1, "b": "y", "c": true })
    );
  }

  #[test]
  fn nested_objects_merge_when_enabled() {
    let merged = merge_objects(
      obj(json!({ "logging": { "level": "info", "pretty": true } })),
      obj(json!({ "logging": { "level": "debug" } })),
      true,
      false,
    )
    .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      json!({ "logging": { "level": "debug", "pretty": true } })
    );
  }

  #[test]
  fn nested_objects_replace_when_disabled() {
    let merged = merge_objects(
      obj(json!({ "logging": { "level": "info", "pretty": true } })),
      obj(json!({ "logging": { "level": "debug" } })),
      false,
      false,
    )
    .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      json!({ "logging": { "level": "debug" } })
    );
  }

  #[test]
  fn arrays_extend_when_enabled() {
    let merged = merge_objects(
      obj(json!({ "paths": ["a"] })),
      obj(json!({ "paths": ["b"] })),
      false,
      true,
    )
    .unwrap();
    assert_eq!(
      serde_json::Value::Object(merged),
      json!({ "paths": ["a", "b"] })
    );
  }

  #[test]
  fn object_type_mismatch_errors() {
    let result = merge_objects(
      obj(json!({ "logging": { "level": "info" } })),
      obj(json!({ "logging": 5 })),
      true,
      false,
    );
    assert!(matches!(
      result,
      Err(Error::ObjectFieldTypeMismatch { .. })
    ));
  }
}
