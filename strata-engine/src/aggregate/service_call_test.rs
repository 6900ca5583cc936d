// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::ServiceCallCollector;
use pretty_assertions::assert_eq;

#[test]
fn accumulates_and_orders_by_duration() {
  let mut collector = ServiceCallCollector::new(10);
  collector.merge_service_call("HTTP", "GET /users", 10.0, 1);
  collector.merge_service_call("HTTP", "GET /orders", 30.0, 1);
  collector.merge_service_call("HTTP", "GET /users", 5.0, 2);

  let by_type = collector.to_service_calls_by_type();
  assert_eq!(1, by_type.len());
  assert_eq!("GET /orders", by_type[0].service_calls[0].text);
  assert_eq!("GET /users", by_type[0].service_calls[1].text);
  assert_eq!(15.0, by_type[0].service_calls[1].total_duration_nanos);
  assert_eq!(3, by_type[0].service_calls[1].execution_count);
}

#[test]
fn truncation_folds_into_overflow() {
  let mut collector = ServiceCallCollector::new(1);
  collector.merge_service_call("HTTP", "a", 5.0, 1);
  collector.merge_service_call("HTTP", "b", 10.0, 1);
  collector.merge_service_call("HTTP", "c", 1.0, 1);

  let by_type = collector.to_service_calls_by_type();
  assert_eq!(1, by_type[0].service_calls.len());
  assert_eq!("b", by_type[0].service_calls[0].text);
  assert!(by_type[0].more_available);
  let overflow = by_type[0].overflow.unwrap();
  assert_eq!(6.0, overflow.total_duration_nanos);
  assert_eq!(2, overflow.execution_count);
}

#[test]
fn stored_round_trip() {
  let mut collector = ServiceCallCollector::new(2);
  for (text, duration) in [("a", 9.0), ("b", 7.0), ("c", 3.0)] {
    collector.merge_service_call("GRPC", text, duration, 1);
  }
  let stored = collector.to_service_calls_by_type();

  let mut rolled = ServiceCallCollector::new(2);
  rolled.merge_service_calls_by_type(&stored);
  assert_eq!(stored, rolled.to_service_calls_by_type());
}
