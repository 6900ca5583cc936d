// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rollup_test.rs"]
mod rollup_test;

use crate::aggregate::MutableAggregate;
use crate::aggregate::query::SharedQueryTexts;
use crate::config::RollupConfig;
use crate::model::{AggregatesByType, TransactionAggregate};
use crate::store::AggregateStore;
use crate::time::{TimeProvider, next_flush_interval, window_end};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use strata_common::stats::Scope;
use tokio::sync::watch;

//
// Stats
//

struct Stats {
  boundaries_rolled_up_total: IntCounter,
  boundaries_rerolled_total: IntCounter,
  rollup_failures_total: IntCounter,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      boundaries_rolled_up_total: scope.counter("boundaries_rolled_up_total"),
      boundaries_rerolled_total: scope.counter("boundaries_rerolled_total"),
      rollup_failures_total: scope.counter("rollup_failures_total"),
    }
  }
}

//
// RollupScheduler
//

// Derives each coarser level from the one below it. For level L, every closed level-L boundary b
// merges the level L-1 aggregates in (b - interval, b] and upserts the result at capture time b.
// Upsert keying makes a re-run of the same boundary idempotent, so watermarks only need to be
// best effort: they are held in memory and rebuilt one boundary back after a restart.
//
// A boundary is not consumed the instant the wall clock passes it: the finest window ending on
// it is flushed by an independent task, so rollup trails the clock by one finest interval. A
// flush that lands even later than that (a retried failure) surfaces through the store's recent
// capture time ledger and marks its boundary dirty for a re-roll.
pub struct RollupScheduler {
  config: RollupConfig,
  store: Arc<dyn AggregateStore>,
  time_provider: Arc<dyn TimeProvider>,
  // (agent_rollup_id, level) -> last boundary successfully rolled up.
  watermarks: Mutex<HashMap<(String, usize), i64>>,
  // (agent_rollup_id, level) -> already rolled boundaries with late finer data, pending re-roll.
  dirty: Mutex<HashMap<(String, usize), BTreeSet<i64>>>,
  stats: Stats,
}

impl RollupScheduler {
  #[must_use]
  pub fn new(
    config: RollupConfig,
    store: Arc<dyn AggregateStore>,
    time_provider: Arc<dyn TimeProvider>,
    scope: &Scope,
  ) -> Self {
    Self {
      config,
      store,
      time_provider,
      watermarks: Mutex::new(HashMap::new()),
      dirty: Mutex::new(HashMap::new()),
      stats: Stats::new(&scope.scope("rollup")),
    }
  }

  // One pass over every agent and level. An error rolling up one agent is logged and counted but
  // never aborts the others; the failed boundary is retried from its watermark next pass.
  pub async fn run_once(&self) {
    let agent_rollup_ids = match self.store.agent_rollup_ids().await {
      Ok(ids) => ids,
      Err(e) => {
        log::warn!("failed to list agent rollup ids: {e}");
        self.stats.rollup_failures_total.inc();
        return;
      },
    };

    for agent_rollup_id in agent_rollup_ids {
      if let Err(e) = self.rollup_agent(&agent_rollup_id).await {
        log::warn!("rollup failed for {agent_rollup_id}, will retry: {e}");
        self.stats.rollup_failures_total.inc();
      }
    }
  }

  async fn rollup_agent(&self, agent_rollup_id: &str) -> anyhow::Result<()> {
    // One finest interval of slack so a window's flush can land before its boundary is consumed.
    let safe_now = self.time_provider.unix_now_millis() - self.config.interval_millis(0);
    for level in 1 .. self.config.levels().len() {
      let interval = self.config.interval_millis(level);
      let last_closed = safe_now / interval * interval;
      let key = (agent_rollup_id.to_string(), level);
      let watermark = self.watermarks.lock().get(&key).copied();

      // Finer windows persisted after their boundary was rolled up are late flushes; mark those
      // boundaries dirty. Boundaries past the watermark are covered by the loop below once they
      // close, so only already consumed ones are kept.
      let recent = self
        .store
        .take_recent_capture_times(agent_rollup_id, level - 1)
        .await?;
      {
        let mut dirty = self.dirty.lock();
        let boundaries = dirty.entry(key.clone()).or_default();
        for capture_time in recent {
          let boundary = window_end(capture_time, interval);
          if watermark.is_some_and(|w| boundary <= w) {
            boundaries.insert(boundary);
          }
        }
      }

      let mut boundary = watermark.unwrap_or(last_closed - interval) + interval;
      while boundary <= last_closed {
        self.rollup_boundary(agent_rollup_id, level, boundary).await?;
        self.watermarks.lock().insert(key.clone(), boundary);
        self.stats.boundaries_rolled_up_total.inc();
        boundary += interval;
      }

      // Re-roll dirty boundaries; the upsert overwrites the stale coarse rows. A failure leaves
      // the boundary in the dirty set for the next pass.
      let pending: Vec<i64> = self
        .dirty
        .lock()
        .get(&key)
        .map(|boundaries| boundaries.iter().copied().collect())
        .unwrap_or_default();
      for boundary in pending {
        self.rollup_boundary(agent_rollup_id, level, boundary).await?;
        if let Some(boundaries) = self.dirty.lock().get_mut(&key) {
          boundaries.remove(&boundary);
        }
        self.stats.boundaries_rerolled_total.inc();
      }
    }
    Ok(())
  }

  async fn rollup_boundary(
    &self,
    agent_rollup_id: &str,
    level: usize,
    boundary: i64,
  ) -> anyhow::Result<()> {
    let interval = self.config.interval_millis(level);
    let rows = self
      .store
      .read_aggregates_for_rollup(agent_rollup_id, level - 1, boundary - interval, boundary)
      .await?;
    if rows.is_empty() {
      return Ok(());
    }

    // BTreeMap keys sort (type, None) ahead of (type, Some(_)), so overall slots come first.
    let mut merged: BTreeMap<(String, Option<String>), MutableAggregate> = BTreeMap::new();
    for row in rows {
      let slot = merged
        .entry((row.transaction_type.clone(), row.transaction_name.clone()))
        .or_insert_with(|| MutableAggregate::new(&self.config.limits));
      slot.merge_aggregate(&row.aggregate, &row.shared_query_texts)?;
    }

    let mut shared_texts = SharedQueryTexts::default();
    let mut by_type: BTreeMap<String, AggregatesByType> = BTreeMap::new();
    for ((transaction_type, transaction_name), aggregate) in &merged {
      let serialized = aggregate.to_aggregate(&mut shared_texts)?;
      let entry = by_type
        .entry(transaction_type.clone())
        .or_insert_with(|| AggregatesByType {
          transaction_type: transaction_type.clone(),
          overall: serialized.clone(),
          transactions: Vec::new(),
        });
      match transaction_name {
        None => entry.overall = serialized,
        Some(name) => entry.transactions.push(TransactionAggregate {
          transaction_name: name.clone(),
          aggregate: serialized,
        }),
      }
    }

    self
      .store
      .store(
        agent_rollup_id,
        boundary,
        level,
        shared_texts.texts,
        by_type.into_values().collect(),
      )
      .await
  }

  // Ticks on level-0 boundaries so coarser levels are checked as soon as they can possibly close.
  pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
    loop {
      let delay = next_flush_interval(self.time_provider.as_ref(), self.config.interval_millis(0));
      tokio::select! {
        () = tokio::time::sleep(delay.unsigned_abs()) => {
          self.run_once().await;
        },
        _ = shutdown.changed() => return,
      }
    }
  }
}
