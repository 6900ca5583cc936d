// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./query_test.rs"]
mod query_test;

use crate::model::{AggregateQuery, OverflowSummary, QueriesByType};
use std::collections::HashMap;

//
// SharedQueryTexts
//

// Deduplicates full query texts across every aggregate flushed in one store() call. Queries
// reference texts by index.
#[derive(Debug, Default)]
pub struct SharedQueryTexts {
  pub texts: Vec<String>,
  index: HashMap<String, usize>,
}

impl SharedQueryTexts {
  pub fn intern(&mut self, text: &str) -> usize {
    if let Some(index) = self.index.get(text) {
      return *index;
    }
    let index = self.texts.len();
    self.texts.push(text.to_string());
    self.index.insert(text.to_string(), index);
    index
  }
}

//
// MutableQuery
//

#[derive(Debug)]
struct MutableQuery {
  total_duration_nanos: f64,
  execution_count: i64,
  // None once any contributing execution failed to report a row count.
  total_rows: Option<i64>,
  full_text: Option<String>,
}

impl MutableQuery {
  fn new(
    duration_nanos: f64,
    execution_count: i64,
    rows: Option<i64>,
    full_text: Option<&str>,
  ) -> Self {
    Self {
      total_duration_nanos: duration_nanos,
      execution_count,
      total_rows: rows,
      full_text: full_text.map(ToString::to_string),
    }
  }

  fn merge(
    &mut self,
    duration_nanos: f64,
    execution_count: i64,
    rows: Option<i64>,
    full_text: Option<&str>,
  ) {
    self.total_duration_nanos += duration_nanos;
    self.execution_count += execution_count;
    self.total_rows = match (self.total_rows, rows) {
      (Some(a), Some(b)) => Some(a + b),
      _ => None,
    };
    if self.full_text.is_none() {
      self.full_text = full_text.map(ToString::to_string);
    }
  }
}

//
// QueryCollector
//

#[derive(Debug, Default)]
struct TypeBucket {
  queries: HashMap<String, MutableQuery>,
  overflow: OverflowSummary,
  more_available: bool,
}

impl TypeBucket {
  fn fold_into_overflow(&mut self, duration_nanos: f64, execution_count: i64) {
    self.more_available = true;
    self.overflow.total_duration_nanos += duration_nanos;
    self.overflow.execution_count += execution_count;
  }
}

// Bounded top-N query accumulator. Entries group by (query type, truncated text). Up to twice the
// limit is retained during accumulation so that eviction decisions are made against union totals;
// output truncation to the limit happens in to_queries_by_type. Evicted totals fold into a
// per-type overflow summary, never silently discarded.
#[derive(Debug)]
pub struct QueryCollector {
  limit: usize,
  buckets: HashMap<String, TypeBucket>,
}

impl QueryCollector {
  #[must_use]
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      buckets: HashMap::new(),
    }
  }

  pub fn merge_query(
    &mut self,
    query_type: &str,
    truncated_text: &str,
    full_text: Option<&str>,
    duration_nanos: f64,
    execution_count: i64,
    rows: Option<i64>,
  ) {
    let limit = self.limit;
    let bucket = self.buckets.entry(query_type.to_string()).or_default();

    if let Some(query) = bucket.queries.get_mut(truncated_text) {
      query.merge(duration_nanos, execution_count, rows, full_text);
      return;
    }

    bucket.queries.insert(
      truncated_text.to_string(),
      MutableQuery::new(duration_nanos, execution_count, rows, full_text),
    );
    if bucket.queries.len() > limit * 2 {
      compress(bucket, limit);
    }
  }

  // Merge stored per-type query lists back in (the rollup path). Full texts are resolved from the
  // shared texts stored alongside the source aggregate.
  pub fn merge_queries_by_type(
    &mut self,
    queries_by_type: &[QueriesByType],
    shared_texts: &[String],
  ) {
    for by_type in queries_by_type {
      for query in &by_type.queries {
        let full_text = query
          .full_text_index
          .and_then(|i| shared_texts.get(i))
          .map(String::as_str);
        self.merge_query(
          &by_type.query_type,
          &query.truncated_text,
          full_text,
          query.total_duration_nanos,
          query.execution_count,
          query.total_rows,
        );
      }

      let bucket = self.buckets.entry(by_type.query_type.clone()).or_default();
      if let Some(overflow) = by_type.overflow {
        bucket.fold_into_overflow(overflow.total_duration_nanos, overflow.execution_count);
      }
      if by_type.more_available {
        bucket.more_available = true;
      }
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.buckets.is_empty()
  }

  // Ordered output: types sorted by name, queries by total duration descending with ties broken
  // by text so results are deterministic. Truncates to the configured limit, folding the tail
  // into the overflow summary.
  #[must_use]
  pub fn to_queries_by_type(&self, shared_texts: &mut SharedQueryTexts) -> Vec<QueriesByType> {
    let mut types: Vec<_> = self.buckets.keys().collect();
    types.sort();

    types
      .into_iter()
      .map(|query_type| {
        let bucket = &self.buckets[query_type];
        let mut queries: Vec<AggregateQuery> = bucket
          .queries
          .iter()
          .map(|(text, query)| AggregateQuery {
            truncated_text: text.clone(),
            total_duration_nanos: query.total_duration_nanos,
            execution_count: query.execution_count,
            total_rows: query.total_rows,
            full_text_index: query.full_text.as_deref().map(|t| shared_texts.intern(t)),
          })
          .collect();
        queries.sort_by(|a, b| {
          b.total_duration_nanos
            .total_cmp(&a.total_duration_nanos)
            .then_with(|| a.truncated_text.cmp(&b.truncated_text))
        });

        let mut more_available = bucket.more_available;
        let mut overflow = bucket.overflow;
        if queries.len() > self.limit {
          more_available = true;
          for query in queries.drain(self.limit ..) {
            overflow.total_duration_nanos += query.total_duration_nanos;
            overflow.execution_count += query.execution_count;
          }
        }

        QueriesByType {
          query_type: query_type.clone(),
          queries,
          overflow: more_available.then_some(overflow),
          more_available,
        }
      })
      .collect()
  }
}

// Fold the lowest ranked half into the overflow summary, retaining the top limit entries.
fn compress(bucket: &mut TypeBucket, limit: usize) {
  let mut entries: Vec<_> = bucket.queries.drain().collect();
  entries.sort_by(|a, b| {
    b.1
      .total_duration_nanos
      .total_cmp(&a.1.total_duration_nanos)
      .then_with(|| a.0.cmp(&b.0))
  });
  for (_, evicted) in entries.drain(limit ..) {
    bucket.fold_into_overflow(evicted.total_duration_nanos, evicted.execution_count);
  }
  bucket.queries = entries.into_iter().collect();
}
