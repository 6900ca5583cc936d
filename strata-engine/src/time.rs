// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./time_test.rs"]
mod time_test;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::{Duration, OffsetDateTime};

// Capture times identify a window by its END. A capture time exactly on a boundary belongs to the
// window ending at that boundary, so membership is left-exclusive/right-inclusive.
#[must_use]
pub fn window_end(capture_time: i64, interval_millis: i64) -> i64 {
  debug_assert!(interval_millis > 0);
  (capture_time + interval_millis - 1) / interval_millis * interval_millis
}

// True if capture_time falls within the window identified by window_end_millis.
#[must_use]
pub fn in_window(capture_time: i64, window_end_millis: i64, interval_millis: i64) -> bool {
  capture_time > window_end_millis - interval_millis && capture_time <= window_end_millis
}

// Determine the next flush delay pegged against wall clock time, so that flushes land on window
// boundaries regardless of process start time.
#[must_use]
pub fn next_flush_interval(time_provider: &dyn TimeProvider, interval_millis: i64) -> Duration {
  let now = time_provider.unix_now_millis();
  let remainder = now % interval_millis;
  Duration::milliseconds(interval_millis - remainder)
}

//
// TimeProvider
//

pub trait TimeProvider: Send + Sync + 'static {
  fn now_utc(&self) -> OffsetDateTime;
  fn unix_now_millis(&self) -> i64;
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }

  fn unix_now_millis(&self) -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
      .try_into()
      .unwrap_or(i64::MAX)
  }
}

//
// TestTimeProvider
//

#[derive(Default)]
pub struct TestTimeProvider {
  pub time_millis: Arc<AtomicI64>,
}

impl TimeProvider for TestTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(
      i128::from(self.time_millis.load(Ordering::SeqCst)) * 1_000_000,
    )
    .unwrap()
  }

  fn unix_now_millis(&self) -> i64 {
    self.time_millis.load(Ordering::SeqCst)
  }
}
