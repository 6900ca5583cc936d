// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{QueryCollector, SharedQueryTexts};
use pretty_assertions::assert_eq;

#[test]
fn groups_same_truncated_text() {
  let mut collector = QueryCollector::new(10);
  collector.merge_query("SQL", "select * from users", None, 100.0, 1, Some(5));
  collector.merge_query("SQL", "select * from users", None, 50.0, 2, Some(3));

  let mut shared = SharedQueryTexts::default();
  let by_type = collector.to_queries_by_type(&mut shared);
  assert_eq!(1, by_type.len());
  assert_eq!(1, by_type[0].queries.len());
  assert_eq!(150.0, by_type[0].queries[0].total_duration_nanos);
  assert_eq!(3, by_type[0].queries[0].execution_count);
  assert_eq!(Some(8), by_type[0].queries[0].total_rows);
  assert!(!by_type[0].more_available);
}

#[test]
fn missing_row_count_propagates() {
  let mut collector = QueryCollector::new(10);
  collector.merge_query("SQL", "q", None, 1.0, 1, Some(5));
  collector.merge_query("SQL", "q", None, 1.0, 1, None);
  collector.merge_query("SQL", "q", None, 1.0, 1, Some(5));

  let mut shared = SharedQueryTexts::default();
  let by_type = collector.to_queries_by_type(&mut shared);
  assert_eq!(None, by_type[0].queries[0].total_rows);
}

#[test]
fn truncates_to_highest_ranked_across_union() {
  // Two partial collections whose union exceeds the limit; the retained entries must be the
  // top ranked of the union, not the top of each input.
  let mut collector = QueryCollector::new(2);
  for (text, duration) in [("a", 10.0), ("b", 1.0), ("c", 5.0)] {
    collector.merge_query("SQL", text, None, duration, 1, None);
  }
  // Second input bumps "b" above "c" in union total.
  collector.merge_query("SQL", "b", None, 7.0, 1, None);

  let mut shared = SharedQueryTexts::default();
  let by_type = collector.to_queries_by_type(&mut shared);
  let queries = &by_type[0].queries;
  assert_eq!(2, queries.len());
  assert_eq!("a", queries[0].truncated_text);
  assert_eq!("b", queries[1].truncated_text);
  assert_eq!(8.0, queries[1].total_duration_nanos);
  assert!(by_type[0].more_available);

  // Evicted totals stay queryable.
  let overflow = by_type[0].overflow.unwrap();
  assert_eq!(5.0, overflow.total_duration_nanos);
  assert_eq!(1, overflow.execution_count);
}

#[test]
fn per_type_limits_are_independent() {
  let mut collector = QueryCollector::new(1);
  collector.merge_query("SQL", "q1", None, 1.0, 1, None);
  collector.merge_query("HTTP", "h1", None, 1.0, 1, None);

  let mut shared = SharedQueryTexts::default();
  let by_type = collector.to_queries_by_type(&mut shared);
  assert_eq!(2, by_type.len());
  assert!(!by_type[0].more_available);
  assert!(!by_type[1].more_available);
}

#[test]
fn shared_text_interning_deduplicates() {
  let mut collector = QueryCollector::new(10);
  collector.merge_query("SQL", "q1", Some("select 1"), 1.0, 1, None);
  collector.merge_query("SQL", "q2", Some("select 1"), 1.0, 1, None);
  collector.merge_query("SQL", "q3", Some("select 2"), 1.0, 1, None);

  let mut shared = SharedQueryTexts::default();
  let by_type = collector.to_queries_by_type(&mut shared);
  assert_eq!(vec!["select 1".to_string(), "select 2".to_string()], {
    let mut texts = shared.texts.clone();
    texts.sort();
    texts
  });
  for query in &by_type[0].queries {
    assert!(query.full_text_index.unwrap() < shared.texts.len());
  }
}

#[test]
fn stored_round_trip_preserves_overflow() {
  let mut collector = QueryCollector::new(2);
  for (text, duration) in [("a", 10.0), ("b", 8.0), ("c", 5.0), ("d", 1.0), ("e", 1.0)] {
    collector.merge_query("SQL", text, None, duration, 1, None);
  }
  let mut shared = SharedQueryTexts::default();
  let stored = collector.to_queries_by_type(&mut shared);

  // Roll the stored form into a fresh collector, as the rollup path does.
  let mut rolled = QueryCollector::new(2);
  rolled.merge_queries_by_type(&stored, &shared.texts);
  let mut shared2 = SharedQueryTexts::default();
  let rolled_stored = rolled.to_queries_by_type(&mut shared2);

  assert_eq!(stored, rolled_stored);
  let total: f64 = rolled_stored[0]
    .queries
    .iter()
    .map(|q| q.total_duration_nanos)
    .sum::<f64>()
    + rolled_stored[0].overflow.unwrap().total_duration_nanos;
  assert_eq!(25.0, total);
}
