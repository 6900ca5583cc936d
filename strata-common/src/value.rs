// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./value_test.rs"]
mod value_test;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

//
// Value
//

// A tagged detail value attached to error messages and other free form payloads. Nesting is
// arbitrary on input so consumers must run truncate() before retaining a value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  Null,
  Bool(bool),
  Number(f64),
  String(String),
  List(Vec<Value>),
  Map(BTreeMap<String, Value>),
}

impl Value {
  // Bound an untrusted value: strings are clipped to max_string_len, lists and maps to
  // max_collection_len entries, and anything nested deeper than max_depth collapses to Null.
  #[must_use]
  pub fn truncate(&self, max_string_len: usize, max_collection_len: usize, max_depth: u32) -> Self {
    if max_depth == 0 {
      return Self::Null;
    }

    match self {
      Self::Null => Self::Null,
      Self::Bool(b) => Self::Bool(*b),
      Self::Number(n) => Self::Number(*n),
      Self::String(s) => {
        if s.len() <= max_string_len {
          Self::String(s.clone())
        } else {
          let mut end = max_string_len;
          while !s.is_char_boundary(end) {
            end -= 1;
          }
          Self::String(s[.. end].to_string())
        }
      },
      Self::List(values) => Self::List(
        values
          .iter()
          .take(max_collection_len)
          .map(|v| v.truncate(max_string_len, max_collection_len, max_depth - 1))
          .collect(),
      ),
      Self::Map(map) => Self::Map(
        map
          .iter()
          .take(max_collection_len)
          .map(|(k, v)| {
            (
              k.clone(),
              v.truncate(max_string_len, max_collection_len, max_depth - 1),
            )
          })
          .collect(),
      ),
    }
  }
}
