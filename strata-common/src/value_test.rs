// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::Value;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

#[test]
fn truncate_clips_strings_on_char_boundaries() {
  let value = Value::String("héllo".to_string());
  // Byte index 2 falls inside the two byte 'é'.
  assert_eq!(Value::String("h".to_string()), value.truncate(2, 10, 10));
  assert_eq!(value, value.truncate(100, 10, 10));
}

#[test]
fn deserializes_from_untagged_json() {
  let value: Value =
    serde_json::from_str(r#"{"code": 503, "retryable": true, "hosts": ["a", "b"]}"#).unwrap();
  let Value::Map(map) = &value else {
    panic!("expected map");
  };
  assert_eq!(Some(&Value::Number(503.0)), map.get("code"));
  assert_eq!(Some(&Value::Bool(true)), map.get("retryable"));
  assert_eq!(
    Some(&Value::List(vec![
      Value::String("a".to_string()),
      Value::String("b".to_string())
    ])),
    map.get("hosts")
  );
}

#[test]
fn truncate_bounds_depth_and_collections() {
  let deep = Value::List(vec![Value::List(vec![Value::List(vec![Value::Number(
    1.0,
  )])])]);
  assert_eq!(
    Value::List(vec![Value::List(vec![Value::Null])]),
    deep.truncate(10, 10, 3)
  );

  let wide = Value::List(vec![Value::Bool(true); 5]);
  assert_eq!(
    Value::List(vec![Value::Bool(true); 2]),
    wide.truncate(10, 2, 10)
  );

  let mut map = BTreeMap::new();
  map.insert("a".to_string(), Value::Number(1.0));
  map.insert("b".to_string(), Value::Number(2.0));
  map.insert("c".to_string(), Value::Number(3.0));
  let Value::Map(truncated) = Value::Map(map).truncate(10, 2, 10) else {
    panic!("expected map");
  };
  assert_eq!(2, truncated.len());
}
