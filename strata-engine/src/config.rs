// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::bail;
use serde::Deserialize;
use std::time::Duration;

const fn default_max_queries_per_type() -> usize {
  500
}

const fn default_max_service_calls_per_type() -> usize {
  500
}

const fn default_max_error_messages() -> usize {
  100
}

const fn default_max_transaction_names_per_type() -> usize {
  500
}

const fn default_max_pending_windows() -> usize {
  8
}

const fn default_live_window_retention() -> usize {
  2
}

fn default_rollup_levels() -> Vec<RollupLevel> {
  vec![
    RollupLevel {
      interval: Duration::from_secs(60),
      view_threshold: Some(Duration::from_secs(2 * 3600)),
    },
    RollupLevel {
      interval: Duration::from_secs(5 * 60),
      view_threshold: Some(Duration::from_secs(10 * 3600)),
    },
    RollupLevel {
      interval: Duration::from_secs(30 * 60),
      view_threshold: Some(Duration::from_secs(60 * 3600)),
    },
    RollupLevel {
      interval: Duration::from_secs(4 * 3600),
      view_threshold: None,
    },
  ]
}

//
// RollupLevel
//

// One resolution level. view_threshold governs the largest requested range for which a UI query
// should still prefer this level; None means unbounded (always the coarsest level).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollupLevel {
  #[serde(with = "humantime_serde")]
  pub interval: Duration,
  #[serde(default, with = "humantime_serde")]
  pub view_threshold: Option<Duration>,
}

impl RollupLevel {
  #[must_use]
  pub fn interval_millis(&self) -> i64 {
    self.interval.as_millis().try_into().unwrap_or(i64::MAX)
  }
}

//
// PendingWindowPolicy
//

// What to do when storage falls behind and the number of retained unflushed windows exceeds
// max_pending_windows.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingWindowPolicy {
  #[default]
  DropOldest,
  RejectNew,
}

//
// CollectorLimits
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CollectorLimits {
  pub max_queries_per_type: usize,
  pub max_service_calls_per_type: usize,
  pub max_error_messages: usize,
  pub max_transaction_names_per_type: usize,
  pub max_pending_windows: usize,
  pub pending_window_policy: PendingWindowPolicy,
  pub live_window_retention: usize,
}

impl Default for CollectorLimits {
  fn default() -> Self {
    Self {
      max_queries_per_type: default_max_queries_per_type(),
      max_service_calls_per_type: default_max_service_calls_per_type(),
      max_error_messages: default_max_error_messages(),
      max_transaction_names_per_type: default_max_transaction_names_per_type(),
      max_pending_windows: default_max_pending_windows(),
      pending_window_policy: PendingWindowPolicy::default(),
      live_window_retention: default_live_window_retention(),
    }
  }
}

//
// EngineConfig
//

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
  pub rollup_levels: Vec<RollupLevel>,
  pub limits: CollectorLimits,
}

//
// RollupConfig
//

// Validated rollup level configuration. Invariant: intervals strictly increasing and each level's
// interval an integer multiple of the previous, so coarser windows are unions of finer windows.
#[derive(Clone, Debug)]
pub struct RollupConfig {
  levels: Vec<RollupLevel>,
  pub limits: CollectorLimits,
}

impl RollupConfig {
  pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
    let levels = if config.rollup_levels.is_empty() {
      default_rollup_levels()
    } else {
      config.rollup_levels
    };

    for (i, level) in levels.iter().enumerate() {
      if level.interval_millis() <= 0 {
        bail!("rollup level {i} interval must be positive");
      }
      if i > 0 {
        let previous = levels[i - 1].interval_millis();
        if level.interval_millis() <= previous {
          bail!("rollup level {i} interval must be greater than level {}", i - 1);
        }
        if level.interval_millis() % previous != 0 {
          bail!(
            "rollup level {i} interval must be a multiple of level {} interval",
            i - 1
          );
        }
      }
    }

    if config.limits.max_pending_windows == 0 {
      bail!("max_pending_windows must be at least 1");
    }

    Ok(Self {
      levels,
      limits: config.limits,
    })
  }

  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    Self::new(serde_yaml::from_str(yaml)?)
  }

  #[must_use]
  pub fn levels(&self) -> &[RollupLevel] {
    &self.levels
  }

  #[must_use]
  pub fn interval_millis(&self, rollup_level: usize) -> i64 {
    self.levels[rollup_level].interval_millis()
  }

  // The level a UI query should read for the requested range: the finest level whose view
  // threshold still covers the range.
  #[must_use]
  pub fn preferred_rollup_level(&self, from: i64, to: i64) -> usize {
    let range = to.saturating_sub(from);
    for (i, level) in self.levels.iter().enumerate() {
      match level.view_threshold {
        None => return i,
        Some(view_threshold) => {
          let view_threshold_millis: i64 =
            view_threshold.as_millis().try_into().unwrap_or(i64::MAX);
          if range <= view_threshold_millis {
            return i;
          }
        },
      }
    }
    self.levels.len() - 1
  }
}

impl Default for RollupConfig {
  fn default() -> Self {
    Self {
      levels: default_rollup_levels(),
      limits: CollectorLimits::default(),
    }
  }
}
