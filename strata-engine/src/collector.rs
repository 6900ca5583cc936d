// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./collector_test.rs"]
mod collector_test;

use crate::aggregate::MutableAggregate;
use crate::aggregate::histogram::HistogramError;
use crate::aggregate::query::SharedQueryTexts;
use crate::config::{CollectorLimits, PendingWindowPolicy, RollupConfig};
use crate::model::{
  AggregatesByType,
  CapturePoint,
  LiveResult,
  OverviewAggregate,
  PercentileAggregate,
  ThroughputAggregate,
  TransactionAggregate,
  TransactionEvent,
};
use crate::store::AggregateStore;
use crate::time::{TimeProvider, next_flush_interval, window_end};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use prometheus::IntCounter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strata_common::stats::Scope;
use tokio::sync::watch;

//
// WindowState
//

// Lifecycle of one window's collector. "Empty" from the state machine is the absence of a
// collector in the set. Flushing is sticky across store failures so the next tick retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WindowState {
  Open,
  Flushing,
  Closed,
}

//
// IntervalCollector
//

type AggregateKey = (String, Option<String>);

#[derive(Default)]
struct Slots {
  aggregates: HashMap<AggregateKey, Arc<Mutex<MutableAggregate>>>,
  names_per_type: HashMap<String, usize>,
}

// Accumulates one level-0 window for one agent. The slot map is behind a RwLock but each
// aggregate has its own mutex, so concurrent transactions for different (type, name) pairs never
// contend.
pub struct IntervalCollector {
  window_end: i64,
  limits: CollectorLimits,
  state: Mutex<WindowState>,
  slots: RwLock<Slots>,
}

impl IntervalCollector {
  #[must_use]
  pub fn new(window_end: i64, limits: CollectorLimits) -> Self {
    Self {
      window_end,
      limits,
      state: Mutex::new(WindowState::Open),
      slots: RwLock::new(Slots::default()),
    }
  }

  #[must_use]
  pub const fn window_end(&self) -> i64 {
    self.window_end
  }

  fn state(&self) -> WindowState {
    *self.state.lock()
  }

  // Returns false when the window stopped accepting writes before the merge happened.
  pub fn add_transaction(&self, event: &TransactionEvent) -> bool {
    // Slot creation may need the map write lock, so resolve both slots first. The per-name slot
    // is None when this type already carries too many distinct names; the transaction then only
    // counts in the overall slot.
    let overall = self.overall_slot(&event.transaction_type);
    let per_name = self.named_slot(&event.transaction_type, &event.transaction_name);

    // Hold the map read lock across the state check and the merges. Flushing is set before
    // serialization takes the write lock, so a writer that observed Open here finishes merging
    // before the flush serializes, and one that lost the race reports the miss instead of
    // writing into an already serialized window.
    let _slots = self.slots.read();
    if *self.state.lock() != WindowState::Open {
      return false;
    }
    overall.lock().add_transaction(event);
    if let Some(per_name) = per_name {
      per_name.lock().add_transaction(event);
    }
    true
  }

  fn overall_slot(&self, transaction_type: &str) -> Arc<Mutex<MutableAggregate>> {
    let key = (transaction_type.to_string(), None);
    if let Some(slot) = self.slots.read().aggregates.get(&key) {
      return slot.clone();
    }
    self
      .slots
      .write()
      .aggregates
      .entry(key)
      .or_insert_with(|| Arc::new(Mutex::new(MutableAggregate::new(&self.limits))))
      .clone()
  }

  fn named_slot(
    &self,
    transaction_type: &str,
    transaction_name: &str,
  ) -> Option<Arc<Mutex<MutableAggregate>>> {
    let key = (
      transaction_type.to_string(),
      Some(transaction_name.to_string()),
    );
    if let Some(slot) = self.slots.read().aggregates.get(&key) {
      return Some(slot.clone());
    }

    let mut slots = self.slots.write();
    // Re-check under the write lock; another thread may have created the slot meanwhile.
    if let Some(slot) = slots.aggregates.get(&key) {
      return Some(slot.clone());
    }
    let names = slots
      .names_per_type
      .entry(transaction_type.to_string())
      .or_default();
    if *names >= self.limits.max_transaction_names_per_type {
      return None;
    }
    *names += 1;
    Some(
      slots
        .aggregates
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(MutableAggregate::new(&self.limits))))
        .clone(),
    )
  }

  // Live read of one aggregate's view. Copies the needed component under a brief per-aggregate
  // lock. The capture time reported for a still-open window is the live time, never the future
  // window end.
  fn live_view<T>(
    &self,
    transaction_type: &str,
    transaction_name: Option<&str>,
    live_capture_time: i64,
    view: impl Fn(&MutableAggregate, i64) -> Result<T, HistogramError>,
  ) -> Option<T> {
    let key = (
      transaction_type.to_string(),
      transaction_name.map(ToString::to_string),
    );
    let slot = self.slots.read().aggregates.get(&key).cloned()?;
    let capture_time = self.window_end.min(live_capture_time);
    let aggregate = slot.lock();
    if aggregate.is_empty() {
      return None;
    }
    match view(&aggregate, capture_time) {
      Ok(value) => Some(value),
      Err(e) => {
        // A single unreadable window must not fail the whole live query.
        log::warn!("skipping live view for window {}: {e}", self.window_end);
        None
      },
    }
  }

  // Serialize every non-empty slot into the grouped storage form. Takes the map write lock so no
  // writer that already passed the Open check can still be merging into a slot.
  fn to_aggregates_by_type(&self) -> Result<(Vec<String>, Vec<AggregatesByType>), HistogramError> {
    let slots = self.slots.write();
    let mut shared_texts = SharedQueryTexts::default();
    let mut by_type: BTreeMap<String, AggregatesByType> = BTreeMap::new();

    for ((transaction_type, transaction_name), slot) in slots
      .aggregates
      .iter()
      .sorted_by(|a, b| a.0.cmp(b.0))
    {
      let aggregate = slot.lock();
      if aggregate.is_empty() {
        continue;
      }
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

    Ok((
      shared_texts.texts,
      by_type.into_values().collect(),
    ))
  }
}

//
// Stats
//

struct Stats {
  transactions_total: IntCounter,
  transactions_rejected_total: IntCounter,
  windows_dropped_total: IntCounter,
  windows_flushed_total: IntCounter,
  flush_failures_total: IntCounter,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      transactions_total: scope.counter("transactions_total"),
      transactions_rejected_total: scope.counter("transactions_rejected_total"),
      windows_dropped_total: scope.counter("windows_dropped_total"),
      windows_flushed_total: scope.counter("windows_flushed_total"),
      flush_failures_total: scope.counter("flush_failures_total"),
    }
  }
}

//
// IntervalCollectorSet
//

// Owns the per-window collectors for one agent and drives the flush lifecycle. Windows are keyed
// by their end time; membership is left-exclusive/right-inclusive so an event exactly on a
// boundary lands in the window ending there.
pub struct IntervalCollectorSet {
  agent_rollup_id: String,
  interval_millis: i64,
  limits: CollectorLimits,
  store: Arc<dyn AggregateStore>,
  time_provider: Arc<dyn TimeProvider>,
  collectors: Mutex<BTreeMap<i64, Arc<IntervalCollector>>>,
  stats: Stats,
}

impl IntervalCollectorSet {
  #[must_use]
  pub fn new(
    agent_rollup_id: String,
    config: &RollupConfig,
    store: Arc<dyn AggregateStore>,
    time_provider: Arc<dyn TimeProvider>,
    scope: &Scope,
  ) -> Self {
    Self {
      agent_rollup_id,
      interval_millis: config.interval_millis(0),
      limits: config.limits.clone(),
      store,
      time_provider,
      collectors: Mutex::new(BTreeMap::new()),
      stats: Stats::new(&scope.scope("collector")),
    }
  }

  // Route a completed transaction to its window. Returns false when the event was rejected or
  // its window dropped under backpressure.
  pub fn add_transaction(&self, event: &TransactionEvent) -> bool {
    let window_end = window_end(event.capture_time, self.interval_millis);
    let collector = {
      let mut collectors = self.collectors.lock();
      if let Some(collector) = collectors.get(&window_end) {
        if collector.state() != WindowState::Open {
          log::debug!(
            "dropping transaction for already flushed window {window_end} of {}",
            self.agent_rollup_id
          );
          self.stats.transactions_rejected_total.inc();
          return false;
        }
        collector.clone()
      } else {
        let pending = collectors
          .values()
          .filter(|c| c.state() != WindowState::Closed)
          .count();
        if pending >= self.limits.max_pending_windows {
          match self.limits.pending_window_policy {
            PendingWindowPolicy::DropOldest => {
              if let Some(oldest) = collectors
                .iter()
                .find(|(_, c)| c.state() != WindowState::Closed)
                .map(|(end, _)| *end)
              {
                log::warn!(
                  "dropping unflushed window {oldest} of {}: {pending} windows pending",
                  self.agent_rollup_id
                );
                collectors.remove(&oldest);
                self.stats.windows_dropped_total.inc();
              }
            },
            PendingWindowPolicy::RejectNew => {
              log::warn!(
                "rejecting transaction for {}: {pending} windows pending",
                self.agent_rollup_id
              );
              self.stats.transactions_rejected_total.inc();
              return false;
            },
          }
        }
        collectors
          .entry(window_end)
          .or_insert_with(|| {
            Arc::new(IntervalCollector::new(window_end, self.limits.clone()))
          })
          .clone()
      }
    };

    // The collector re-checks its own state under the slot map lock; a flush that raced us past
    // the check above shows up here as a rejected write rather than a silently lost one.
    if collector.add_transaction(event) {
      self.stats.transactions_total.inc();
      true
    } else {
      self.stats.transactions_rejected_total.inc();
      false
    }
  }

  // Flush every window whose end has passed. Failed flushes stay in Flushing and are retried on
  // the next call. Closed windows are retained for live queries, bounded by live_window_retention.
  pub async fn flush_expired(&self) {
    let now = self.time_provider.unix_now_millis();
    let due: Vec<_> = {
      let collectors = self.collectors.lock();
      collectors
        .values()
        .filter(|c| c.window_end() <= now && c.state() != WindowState::Closed)
        .cloned()
        .collect()
    };

    for collector in due {
      *collector.state.lock() = WindowState::Flushing;
      if let Err(e) = self.flush_collector(&collector).await {
        log::warn!(
          "failed to flush window {} of {}, will retry: {e}",
          collector.window_end(),
          self.agent_rollup_id
        );
        self.stats.flush_failures_total.inc();
      } else {
        *collector.state.lock() = WindowState::Closed;
        self.stats.windows_flushed_total.inc();
      }
    }

    self.evict_closed();
  }

  async fn flush_collector(&self, collector: &IntervalCollector) -> anyhow::Result<()> {
    let (shared_texts, aggregates_by_type) = collector.to_aggregates_by_type()?;
    if aggregates_by_type.is_empty() {
      return Ok(());
    }
    self
      .store
      .store(
        &self.agent_rollup_id,
        collector.window_end(),
        0,
        shared_texts,
        aggregates_by_type,
      )
      .await
  }

  fn evict_closed(&self) {
    let mut collectors = self.collectors.lock();
    let closed: Vec<_> = collectors
      .iter()
      .filter(|(_, c)| c.state() == WindowState::Closed)
      .map(|(end, _)| *end)
      .collect();
    if closed.len() > self.limits.live_window_retention {
      for end in &closed[.. closed.len() - self.limits.live_window_retention] {
        collectors.remove(end);
      }
    }
  }

  // Collectors whose window end lies in (from, to], ascending.
  #[must_use]
  pub fn ordered_collectors_in_range(&self, from: i64, to: i64) -> Vec<Arc<IntervalCollector>> {
    self
      .collectors
      .lock()
      .range((
        std::ops::Bound::Excluded(from),
        std::ops::Bound::Included(to),
      ))
      .map(|(_, c)| c.clone())
      .collect()
  }

  pub fn get_live_overview_aggregates(
    &self,
    transaction_type: &str,
    transaction_name: Option<&str>,
    from: i64,
    to: i64,
    live_capture_time: i64,
  ) -> Option<LiveResult<OverviewAggregate>> {
    self.live_values(transaction_type, transaction_name, from, to, live_capture_time, |a, t| {
      Ok(a.to_overview_aggregate(t))
    })
  }

  pub fn get_live_percentile_aggregates(
    &self,
    transaction_type: &str,
    transaction_name: Option<&str>,
    from: i64,
    to: i64,
    live_capture_time: i64,
  ) -> Option<LiveResult<PercentileAggregate>> {
    self.live_values(
      transaction_type,
      transaction_name,
      from,
      to,
      live_capture_time,
      MutableAggregate::to_percentile_aggregate,
    )
  }

  pub fn get_live_throughput_aggregates(
    &self,
    transaction_type: &str,
    transaction_name: Option<&str>,
    from: i64,
    to: i64,
    live_capture_time: i64,
  ) -> Option<LiveResult<ThroughputAggregate>> {
    self.live_values(transaction_type, transaction_name, from, to, live_capture_time, |a, t| {
      Ok(a.to_throughput_aggregate(t))
    })
  }

  // None means no live data at all; callers fall back to storage. When present,
  // initial_capture_time bounds the storage read callers merge underneath the live values.
  fn live_values<T: CapturePoint>(
    &self,
    transaction_type: &str,
    transaction_name: Option<&str>,
    from: i64,
    to: i64,
    live_capture_time: i64,
    view: impl Fn(&MutableAggregate, i64) -> Result<T, HistogramError> + Copy,
  ) -> Option<LiveResult<T>> {
    let values: Vec<T> = self
      .ordered_collectors_in_range(from, to)
      .into_iter()
      .filter_map(|c| c.live_view(transaction_type, transaction_name, live_capture_time, view))
      .collect();
    let initial_capture_time = values.first()?.capture_time();
    Some(LiveResult {
      values,
      initial_capture_time,
    })
  }

  // Wall-clock aligned flush loop. Runs until the shutdown channel fires, then takes a final
  // flush pass so an orderly shutdown loses nothing that storage will accept.
  pub async fn flush_loop(&self, mut shutdown: watch::Receiver<bool>) {
    loop {
      let delay = next_flush_interval(self.time_provider.as_ref(), self.interval_millis);
      tokio::select! {
        () = tokio::time::sleep(delay.unsigned_abs()) => {
          self.flush_expired().await;
        },
        _ = shutdown.changed() => {
          self.flush_expired().await;
          return;
        },
      }
    }
  }
}
