// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{TestTimeProvider, in_window, next_flush_interval, window_end};
use std::sync::atomic::Ordering;
use time::Duration;

#[test]
fn window_end_boundary_exactness() {
  // A capture time exactly on a boundary belongs to the window ending there.
  assert_eq!(60_000, window_end(60_000, 60_000));
  // One past the boundary belongs to the next window.
  assert_eq!(120_000, window_end(60_001, 60_000));
  assert_eq!(60_000, window_end(1, 60_000));
  assert_eq!(60_000, window_end(59_999, 60_000));
}

#[test]
fn in_window_left_exclusive_right_inclusive() {
  // Window (60_000, 120_000].
  assert!(!in_window(60_000, 120_000, 60_000));
  assert!(in_window(60_001, 120_000, 60_000));
  assert!(in_window(120_000, 120_000, 60_000));
  assert!(!in_window(120_001, 120_000, 60_000));
}

#[test]
fn next_flush_interval_pegs_to_wall_clock() {
  let time_provider = TestTimeProvider::default();
  time_provider.time_millis.store(90_000, Ordering::SeqCst);
  assert_eq!(
    Duration::milliseconds(30_000),
    next_flush_interval(&time_provider, 60_000)
  );

  // Exactly on a boundary waits a full interval.
  time_provider.time_millis.store(120_000, Ordering::SeqCst);
  assert_eq!(
    Duration::milliseconds(60_000),
    next_flush_interval(&time_provider, 60_000)
  );
}
