// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{MAX_TIMER_DEPTH, merge_root_timers, to_snapshots};
use crate::model::TimerSnapshot;
use pretty_assertions::assert_eq;

fn timer(name: &str, extended: bool, total_nanos: f64, count: i64) -> TimerSnapshot {
  TimerSnapshot {
    name: name.to_string(),
    extended,
    total_nanos,
    count,
    child_timers: vec![],
  }
}

fn timer_with_children(
  name: &str,
  total_nanos: f64,
  count: i64,
  child_timers: Vec<TimerSnapshot>,
) -> TimerSnapshot {
  TimerSnapshot {
    name: name.to_string(),
    extended: false,
    total_nanos,
    count,
    child_timers,
  }
}

#[test]
fn merges_same_keyed_children_recursively() {
  let a = timer_with_children(
    "http request",
    100.0,
    1,
    vec![timer("jdbc query", false, 40.0, 2)],
  );
  let b = timer_with_children(
    "http request",
    50.0,
    1,
    vec![
      timer("jdbc query", false, 10.0, 1),
      timer("render", false, 5.0, 1),
    ],
  );

  let mut merged = vec![];
  merge_root_timers(&[a], &mut merged);
  merge_root_timers(&[b], &mut merged);

  assert_eq!(
    vec![timer_with_children(
      "http request",
      150.0,
      2,
      vec![
        timer("jdbc query", false, 50.0, 3),
        timer("render", false, 5.0, 1),
      ],
    )],
    to_snapshots(&merged)
  );
}

#[test]
fn extended_child_is_distinct_from_non_extended() {
  let a = timer_with_children("root", 10.0, 1, vec![timer("work", false, 4.0, 1)]);
  let b = timer_with_children("root", 10.0, 1, vec![timer("work", true, 6.0, 1)]);

  let mut merged = vec![];
  merge_root_timers(&[a, b], &mut merged);

  assert_eq!(1, merged.len());
  assert_eq!(2, merged[0].child_timers.len());
}

#[test]
fn merge_is_order_independent() {
  let trees = vec![
    timer_with_children("root", 10.0, 1, vec![timer("a", false, 1.0, 1)]),
    timer_with_children("root", 20.0, 2, vec![timer("b", false, 2.0, 1)]),
    timer_with_children("root", 30.0, 3, vec![timer("a", false, 3.0, 2)]),
  ];

  let mut forward = vec![];
  for tree in &trees {
    merge_root_timers(std::slice::from_ref(tree), &mut forward);
  }

  let mut reverse = vec![];
  for tree in trees.iter().rev() {
    merge_root_timers(std::slice::from_ref(tree), &mut reverse);
  }

  // Snapshots are canonically ordered, so the two merge orders serialize identically.
  assert_eq!(to_snapshots(&forward), to_snapshots(&reverse));
  assert_eq!(
    vec!["a", "b"],
    to_snapshots(&forward)[0]
      .child_timers
      .iter()
      .map(|c| c.name.as_str())
      .collect::<Vec<_>>()
  );
}

#[test]
fn deep_trees_fold_past_the_cap() {
  // Build a chain deeper than the cap.
  let mut node = timer("leaf", false, 1.0, 1);
  for i in 0 .. MAX_TIMER_DEPTH + 50 {
    node = TimerSnapshot {
      name: format!("level{i}"),
      extended: false,
      total_nanos: 1.0,
      count: 1,
      child_timers: vec![node],
    };
  }

  let mut merged = vec![];
  merge_root_timers(std::slice::from_ref(&node), &mut merged);

  // The retained tree is bounded and no totals were lost.
  let mut depth = 0;
  let mut total = 0.0;
  let mut current = &merged[0];
  loop {
    depth += 1;
    total += current.total_nanos;
    match current.child_timers.first() {
      Some(child) => current = child,
      None => break,
    }
  }
  assert!(depth <= MAX_TIMER_DEPTH);
  assert_eq!((MAX_TIMER_DEPTH + 51) as f64, total);
}
