// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./timer_test.rs"]
mod timer_test;

use crate::model::TimerSnapshot;

// Depth cap enforced while merging, not while reading, so reads complete in bounded time even on
// pathological input. Nodes past the cap fold their totals into the deepest retained ancestor.
pub const MAX_TIMER_DEPTH: usize = 100;

//
// MutableTimer
//

// One node of an aggregated timer tree. Children are keyed by (name, extended) because an
// extended timer is a recursive extension of its parent rather than a new stack frame.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableTimer {
  pub name: String,
  pub extended: bool,
  pub total_nanos: f64,
  pub count: i64,
  pub child_timers: Vec<MutableTimer>,
}

impl MutableTimer {
  fn new(name: &str, extended: bool) -> Self {
    Self {
      name: name.to_string(),
      extended,
      total_nanos: 0.0,
      count: 0,
      child_timers: Vec::new(),
    }
  }

  fn merge(&mut self, snapshot: &TimerSnapshot, depth: usize) {
    self.total_nanos += snapshot.total_nanos;
    self.count += snapshot.count;
    if depth >= MAX_TIMER_DEPTH {
      // Fold everything below the cap into this node's totals.
      for child in &snapshot.child_timers {
        self.fold_subtree(child);
      }
    } else {
      merge_child_timers(&snapshot.child_timers, &mut self.child_timers, depth + 1);
    }
  }

  fn fold_subtree(&mut self, snapshot: &TimerSnapshot) {
    self.total_nanos += snapshot.total_nanos;
    self.count += snapshot.count;
    for child in &snapshot.child_timers {
      self.fold_subtree(child);
    }
  }

  #[must_use]
  pub fn to_snapshot(&self) -> TimerSnapshot {
    TimerSnapshot {
      name: self.name.clone(),
      extended: self.extended,
      total_nanos: self.total_nanos,
      count: self.count,
      child_timers: to_snapshots(&self.child_timers),
    }
  }
}

// Merge incoming root timers into the mutable root list. Roots match by name; children match by
// (name, extended). Matching is by key and never by position, which keeps the merge commutative
// and associative regardless of input ordering.
pub fn merge_root_timers(snapshots: &[TimerSnapshot], into: &mut Vec<MutableTimer>) {
  for snapshot in snapshots {
    let existing = into.iter().position(|t| t.name == snapshot.name);
    let index = existing.unwrap_or_else(|| {
      into.push(MutableTimer::new(&snapshot.name, snapshot.extended));
      into.len() - 1
    });
    into[index].merge(snapshot, 1);
  }
}

fn merge_child_timers(snapshots: &[TimerSnapshot], into: &mut Vec<MutableTimer>, depth: usize) {
  for snapshot in snapshots {
    let existing = into
      .iter()
      .position(|t| t.name == snapshot.name && t.extended == snapshot.extended);
    let index = existing.unwrap_or_else(|| {
      into.push(MutableTimer::new(&snapshot.name, snapshot.extended));
      into.len() - 1
    });
    into[index].merge(snapshot, depth);
  }
}

// Snapshots sort by (name, extended) at every level so the same merged totals serialize
// identically no matter what order their inputs arrived in.
#[must_use]
pub fn to_snapshots(timers: &[MutableTimer]) -> Vec<TimerSnapshot> {
  let mut snapshots: Vec<_> = timers.iter().map(MutableTimer::to_snapshot).collect();
  snapshots.sort_by(|a, b| (&a.name, a.extended).cmp(&(&b.name, b.extended)));
  snapshots
}
