// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{MAX_PROFILE_DEPTH, MAX_PROFILE_NODES, MutableProfile};
use crate::model::ProfileNode;
use pretty_assertions::assert_eq;

fn node(frame: &str, sample_count: i64, child_nodes: Vec<ProfileNode>) -> ProfileNode {
  ProfileNode {
    frame: frame.to_string(),
    sample_count,
    child_nodes,
  }
}

#[test]
fn merges_matching_frames() {
  let mut profile = MutableProfile::default();
  profile.merge_profile(&node(
    "main",
    2,
    vec![node("handle_request", 2, vec![])],
  ));
  profile.merge_profile(&node(
    "main",
    3,
    vec![node("handle_request", 1, vec![]), node("gc", 2, vec![])],
  ));

  let snapshot = profile.to_snapshot().unwrap();
  assert_eq!("main", snapshot.frame);
  assert_eq!(5, snapshot.sample_count);
  assert_eq!(2, snapshot.child_nodes.len());
  assert_eq!(3, snapshot.child_nodes[0].sample_count);
}

#[test]
fn empty_profile_has_no_snapshot() {
  let profile = MutableProfile::default();
  assert!(profile.is_empty());
  assert_eq!(None, profile.to_snapshot());
}

#[test]
fn multiple_roots_wrap_under_synthetic_frame() {
  let mut profile = MutableProfile::default();
  profile.merge_profile(&node("main", 1, vec![]));
  profile.merge_profile(&node("worker", 2, vec![]));

  let snapshot = profile.to_snapshot().unwrap();
  assert_eq!("", snapshot.frame);
  assert_eq!(3, snapshot.sample_count);
  assert_eq!(2, snapshot.child_nodes.len());
}

#[test]
fn node_budget_folds_new_frames_into_their_parent() {
  let children: Vec<_> = (0 .. MAX_PROFILE_NODES)
    .map(|i| node(&format!("f{i}"), 1, vec![]))
    .collect();
  let mut profile = MutableProfile::default();
  profile.merge_profile(&node("main", 1, children));

  // The root plus MAX_PROFILE_NODES - 1 children fill the budget; the last child's sample folds
  // into its parent, the root.
  let snapshot = profile.to_snapshot().unwrap();
  assert_eq!(MAX_PROFILE_NODES - 1, snapshot.child_nodes.len());
  assert_eq!(2, snapshot.sample_count);

  // A later unseen subtree also lands on the parent, never on an unrelated sibling.
  profile.merge_profile(&node(
    "main",
    0,
    vec![node("late", 3, vec![node("deeper", 4, vec![])])],
  ));
  let snapshot = profile.to_snapshot().unwrap();
  assert_eq!(MAX_PROFILE_NODES - 1, snapshot.child_nodes.len());
  assert_eq!(9, snapshot.sample_count);
  assert!(snapshot.child_nodes.iter().all(|c| c.sample_count == 1));
}

#[test]
fn deep_stacks_fold_past_depth_cap() {
  let mut chain = node("leaf", 1, vec![]);
  for i in 0 .. MAX_PROFILE_DEPTH + 10 {
    chain = node(&format!("frame{i}"), 1, vec![chain]);
  }

  let mut profile = MutableProfile::default();
  profile.merge_profile(&chain);

  let snapshot = profile.to_snapshot().unwrap();
  let mut depth = 0;
  let mut total = 0;
  let mut current = &snapshot;
  loop {
    depth += 1;
    total += current.sample_count;
    match current.child_nodes.first() {
      Some(child) => current = child,
      None => break,
    }
  }
  assert!(depth <= MAX_PROFILE_DEPTH);
  // No samples lost to the fold.
  assert_eq!((MAX_PROFILE_DEPTH + 11) as i64, total);
}
