// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./service_call_test.rs"]
mod service_call_test;

use crate::model::{AggregateServiceCall, OverflowSummary, ServiceCallsByType};
use std::collections::HashMap;

//
// ServiceCallCollector
//

#[derive(Debug, Default)]
struct MutableServiceCall {
  total_duration_nanos: f64,
  execution_count: i64,
}

#[derive(Debug, Default)]
struct TypeBucket {
  service_calls: HashMap<String, MutableServiceCall>,
  overflow: OverflowSummary,
  more_available: bool,
}

// Bounded top-N service call accumulator. Same discipline as QueryCollector: accumulate up to
// twice the limit, truncate against union totals on output, evicted totals fold into the per-type
// overflow summary.
#[derive(Debug)]
pub struct ServiceCallCollector {
  limit: usize,
  buckets: HashMap<String, TypeBucket>,
}

impl ServiceCallCollector {
  #[must_use]
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      buckets: HashMap::new(),
    }
  }

  pub fn merge_service_call(
    &mut self,
    service_call_type: &str,
    text: &str,
    duration_nanos: f64,
    execution_count: i64,
  ) {
    let limit = self.limit;
    let bucket = self.buckets.entry(service_call_type.to_string()).or_default();

    let service_call = bucket.service_calls.entry(text.to_string()).or_default();
    service_call.total_duration_nanos += duration_nanos;
    service_call.execution_count += execution_count;

    if bucket.service_calls.len() > limit * 2 {
      compress(bucket, limit);
    }
  }

  pub fn merge_service_calls_by_type(&mut self, service_calls_by_type: &[ServiceCallsByType]) {
    for by_type in service_calls_by_type {
      for service_call in &by_type.service_calls {
        self.merge_service_call(
          &by_type.service_call_type,
          &service_call.text,
          service_call.total_duration_nanos,
          service_call.execution_count,
        );
      }

      let bucket = self
        .buckets
        .entry(by_type.service_call_type.clone())
        .or_default();
      if let Some(overflow) = by_type.overflow {
        bucket.more_available = true;
        bucket.overflow.total_duration_nanos += overflow.total_duration_nanos;
        bucket.overflow.execution_count += overflow.execution_count;
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

  #[must_use]
  pub fn to_service_calls_by_type(&self) -> Vec<ServiceCallsByType> {
    let mut types: Vec<_> = self.buckets.keys().collect();
    types.sort();

    types
      .into_iter()
      .map(|service_call_type| {
        let bucket = &self.buckets[service_call_type];
        let mut service_calls: Vec<AggregateServiceCall> = bucket
          .service_calls
          .iter()
          .map(|(text, service_call)| AggregateServiceCall {
            text: text.clone(),
            total_duration_nanos: service_call.total_duration_nanos,
            execution_count: service_call.execution_count,
          })
          .collect();
        service_calls.sort_by(|a, b| {
          b.total_duration_nanos
            .total_cmp(&a.total_duration_nanos)
            .then_with(|| a.text.cmp(&b.text))
        });

        let mut more_available = bucket.more_available;
        let mut overflow = bucket.overflow;
        if service_calls.len() > self.limit {
          more_available = true;
          for service_call in service_calls.drain(self.limit ..) {
            overflow.total_duration_nanos += service_call.total_duration_nanos;
            overflow.execution_count += service_call.execution_count;
          }
        }

        ServiceCallsByType {
          service_call_type: service_call_type.clone(),
          service_calls,
          overflow: more_available.then_some(overflow),
          more_available,
        }
      })
      .collect()
  }
}

fn compress(bucket: &mut TypeBucket, limit: usize) {
  bucket.more_available = true;
  let mut entries: Vec<_> = bucket.service_calls.drain().collect();
  entries.sort_by(|a, b| {
    b.1
      .total_duration_nanos
      .total_cmp(&a.1.total_duration_nanos)
      .then_with(|| a.0.cmp(&b.0))
  });
  for (_, evicted) in entries.drain(limit ..) {
    bucket.overflow.total_duration_nanos += evicted.total_duration_nanos;
    bucket.overflow.execution_count += evicted.execution_count;
  }
  bucket.service_calls = entries.into_iter().collect();
}
