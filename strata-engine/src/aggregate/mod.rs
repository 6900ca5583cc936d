// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod error_message;
pub mod histogram;
pub mod profile;
pub mod query;
pub mod service_call;
pub mod timer;

use self::error_message::ErrorMessageCollector;
use self::histogram::{DurationHistogram, HistogramError};
use self::profile::MutableProfile;
use self::query::{QueryCollector, SharedQueryTexts};
use self::service_call::ServiceCallCollector;
use self::timer::{MutableTimer, merge_root_timers, to_snapshots};
use crate::config::CollectorLimits;
use crate::model::{
  Aggregate,
  OverviewAggregate,
  PercentileAggregate,
  ProfileNode,
  ThreadStatsSnapshot,
  ThroughputAggregate,
  TimerSnapshot,
  TransactionEvent,
};
use strata_common::LossyIntoToFloat;

//
// NotAvailableAware
//

// A statistic that the underlying platform may not supply. "Not available" is sticky: once any
// contribution reports NA the merged value is NA for the whole window, never silently zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NotAvailableAware {
  Value(f64),
  NotAvailable,
}

impl Default for NotAvailableAware {
  fn default() -> Self {
    Self::Value(0.0)
  }
}

impl NotAvailableAware {
  pub fn merge(&mut self, other: Option<f64>) {
    *self = match (*self, other) {
      (Self::Value(a), Some(b)) => Self::Value(a + b),
      _ => Self::NotAvailable,
    };
  }

  #[must_use]
  pub const fn to_option(self) -> Option<f64> {
    match self {
      Self::Value(v) => Some(v),
      Self::NotAvailable => None,
    }
  }
}

//
// MutableThreadStats
//

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MutableThreadStats {
  total_cpu_nanos: NotAvailableAware,
  total_blocked_nanos: NotAvailableAware,
  total_waited_nanos: NotAvailableAware,
  total_allocated_bytes: NotAvailableAware,
}

impl MutableThreadStats {
  pub fn merge(&mut self, snapshot: &ThreadStatsSnapshot) {
    self.total_cpu_nanos.merge(snapshot.total_cpu_nanos);
    self.total_blocked_nanos.merge(snapshot.total_blocked_nanos);
    self.total_waited_nanos.merge(snapshot.total_waited_nanos);
    self
      .total_allocated_bytes
      .merge(snapshot.total_allocated_bytes);
  }

  #[must_use]
  pub fn to_snapshot(&self) -> ThreadStatsSnapshot {
    ThreadStatsSnapshot {
      total_cpu_nanos: self.total_cpu_nanos.to_option(),
      total_blocked_nanos: self.total_blocked_nanos.to_option(),
      total_waited_nanos: self.total_waited_nanos.to_option(),
      total_allocated_bytes: self.total_allocated_bytes.to_option(),
    }
  }
}

//
// MutableAggregate
//

// The live, writable counterpart of Aggregate for one (transaction type, optional transaction
// name) within one window. Not internally thread safe: the interval collector wraps each instance
// in its own mutex. Every merge operation is pure accumulation, so the final state is independent
// of merge order.
pub struct MutableAggregate {
  total_duration_nanos: f64,
  transaction_count: i64,
  error_count: i64,
  async_transactions: bool,
  main_thread_root_timers: Vec<MutableTimer>,
  aux_thread_root_timers: Vec<MutableTimer>,
  async_timers: Vec<MutableTimer>,
  main_thread_stats: MutableThreadStats,
  aux_thread_stats: MutableThreadStats,
  duration_nanos_histogram: DurationHistogram,
  queries: QueryCollector,
  service_calls: ServiceCallCollector,
  error_messages: ErrorMessageCollector,
  main_thread_profile: MutableProfile,
  aux_thread_profile: MutableProfile,
}

impl MutableAggregate {
  #[must_use]
  pub fn new(limits: &CollectorLimits) -> Self {
    Self {
      total_duration_nanos: 0.0,
      transaction_count: 0,
      error_count: 0,
      async_transactions: false,
      main_thread_root_timers: Vec::new(),
      aux_thread_root_timers: Vec::new(),
      async_timers: Vec::new(),
      main_thread_stats: MutableThreadStats::default(),
      aux_thread_stats: MutableThreadStats::default(),
      duration_nanos_histogram: DurationHistogram::default(),
      queries: QueryCollector::new(limits.max_queries_per_type),
      service_calls: ServiceCallCollector::new(limits.max_service_calls_per_type),
      error_messages: ErrorMessageCollector::new(limits.max_error_messages),
      main_thread_profile: MutableProfile::default(),
      aux_thread_profile: MutableProfile::default(),
    }
  }

  // Merge one completed transaction. Malformed samples (negative duration) are logged and
  // skipped; a single bad transaction must not corrupt the window.
  pub fn add_transaction(&mut self, event: &TransactionEvent) {
    if event.duration_nanos < 0 {
      log::warn!(
        "skipping transaction '{}' with negative duration {}",
        event.transaction_name,
        event.duration_nanos
      );
      return;
    }

    self.add_total_duration_nanos(event.duration_nanos.lossy_to_f64());
    self.add_transaction_count(1);
    if let Some(error) = &event.error {
      self.add_error_count(1);
      let bounded = error.bounded();
      self.merge_error(&bounded.message, 1);
    }
    if event.async_transaction {
      self.async_transactions = true;
    }
    self.merge_main_thread_root_timers(&event.main_thread_root_timers);
    self.merge_aux_thread_root_timers(&event.aux_thread_root_timers);
    self.merge_async_timers(&event.async_timers);
    self.merge_main_thread_stats(&event.main_thread_stats);
    if let Some(aux_thread_stats) = &event.aux_thread_stats {
      self.merge_aux_thread_stats(aux_thread_stats);
    }
    #[allow(clippy::cast_sign_loss)]
    self
      .duration_nanos_histogram
      .add_value(event.duration_nanos as u64);
    for query in &event.queries {
      self.merge_query(
        &query.query_type,
        &query.truncated_text,
        query.full_text.as_deref(),
        query.duration_nanos,
        query.execution_count,
        query.total_rows,
      );
    }
    for service_call in &event.service_calls {
      self.merge_service_call(
        &service_call.service_call_type,
        &service_call.text,
        service_call.duration_nanos,
        service_call.execution_count,
      );
    }
    if let Some(profile) = &event.main_thread_profile {
      self.merge_main_thread_profile(profile);
    }
    if let Some(profile) = &event.aux_thread_profile {
      self.merge_aux_thread_profile(profile);
    }
  }

  // Merge a stored aggregate (the rollup path). shared_texts is the text table stored alongside
  // the source aggregate.
  pub fn merge_aggregate(
    &mut self,
    aggregate: &Aggregate,
    shared_texts: &[String],
  ) -> Result<(), HistogramError> {
    self.add_total_duration_nanos(aggregate.total_duration_nanos);
    self.add_transaction_count(aggregate.transaction_count);
    self.add_error_count(aggregate.error_count);
    if aggregate.async_transactions {
      self.async_transactions = true;
    }
    self.merge_main_thread_root_timers(&aggregate.main_thread_root_timers);
    self.merge_aux_thread_root_timers(&aggregate.aux_thread_root_timers);
    self.merge_async_timers(&aggregate.async_timers);
    self.merge_main_thread_stats(&aggregate.main_thread_stats);
    self.merge_aux_thread_stats(&aggregate.aux_thread_stats);
    self.merge_duration_nanos_histogram(&aggregate.duration_nanos_histogram)?;
    self
      .queries
      .merge_queries_by_type(&aggregate.queries_by_type, shared_texts);
    self
      .service_calls
      .merge_service_calls_by_type(&aggregate.service_calls_by_type);
    self.error_messages.merge_error_messages(&aggregate.error_messages);
    if let Some(profile) = &aggregate.main_thread_profile {
      self.merge_main_thread_profile(profile);
    }
    if let Some(profile) = &aggregate.aux_thread_profile {
      self.merge_aux_thread_profile(profile);
    }
    Ok(())
  }

  pub fn add_total_duration_nanos(&mut self, total_duration_nanos: f64) {
    self.total_duration_nanos += total_duration_nanos;
  }

  pub fn add_transaction_count(&mut self, transaction_count: i64) {
    self.transaction_count += transaction_count;
  }

  pub fn add_error_count(&mut self, error_count: i64) {
    self.error_count += error_count;
  }

  pub fn merge_main_thread_root_timers(&mut self, timers: &[TimerSnapshot]) {
    merge_root_timers(timers, &mut self.main_thread_root_timers);
  }

  pub fn merge_aux_thread_root_timers(&mut self, timers: &[TimerSnapshot]) {
    merge_root_timers(timers, &mut self.aux_thread_root_timers);
  }

  pub fn merge_async_timers(&mut self, timers: &[TimerSnapshot]) {
    merge_root_timers(timers, &mut self.async_timers);
  }

  pub fn merge_main_thread_stats(&mut self, stats: &ThreadStatsSnapshot) {
    self.main_thread_stats.merge(stats);
  }

  pub fn merge_aux_thread_stats(&mut self, stats: &ThreadStatsSnapshot) {
    self.aux_thread_stats.merge(stats);
  }

  pub fn merge_duration_nanos_histogram(&mut self, encoded: &[u8]) -> Result<(), HistogramError> {
    self.duration_nanos_histogram.merge_encoded(encoded)
  }

  pub fn merge_query(
    &mut self,
    query_type: &str,
    truncated_text: &str,
    full_text: Option<&str>,
    duration_nanos: f64,
    execution_count: i64,
    rows: Option<i64>,
  ) {
    self.queries.merge_query(
      query_type,
      truncated_text,
      full_text,
      duration_nanos,
      execution_count,
      rows,
    );
  }

  pub fn merge_service_call(
    &mut self,
    service_call_type: &str,
    text: &str,
    duration_nanos: f64,
    execution_count: i64,
  ) {
    self
      .service_calls
      .merge_service_call(service_call_type, text, duration_nanos, execution_count);
  }

  pub fn merge_error(&mut self, message: &str, count: i64) {
    self.error_messages.merge_error(message, count);
  }

  pub fn merge_main_thread_profile(&mut self, profile: &ProfileNode) {
    self.main_thread_profile.merge_profile(profile);
  }

  pub fn merge_aux_thread_profile(&mut self, profile: &ProfileNode) {
    self.aux_thread_profile.merge_profile(profile);
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.transaction_count == 0
  }

  #[must_use]
  pub fn to_overview_aggregate(&self, capture_time: i64) -> OverviewAggregate {
    OverviewAggregate {
      capture_time,
      total_duration_nanos: self.total_duration_nanos,
      transaction_count: self.transaction_count,
      async_transactions: self.async_transactions,
      main_thread_root_timers: to_snapshots(&self.main_thread_root_timers),
      aux_thread_root_timers: to_snapshots(&self.aux_thread_root_timers),
      async_timers: to_snapshots(&self.async_timers),
      main_thread_stats: self.main_thread_stats.to_snapshot(),
      aux_thread_stats: self.aux_thread_stats.to_snapshot(),
    }
  }

  pub fn to_percentile_aggregate(
    &self,
    capture_time: i64,
  ) -> Result<PercentileAggregate, HistogramError> {
    Ok(PercentileAggregate {
      capture_time,
      total_duration_nanos: self.total_duration_nanos,
      transaction_count: self.transaction_count,
      duration_nanos_histogram: self.duration_nanos_histogram.to_encoded()?,
    })
  }

  #[must_use]
  pub const fn to_throughput_aggregate(&self, capture_time: i64) -> ThroughputAggregate {
    ThroughputAggregate {
      capture_time,
      transaction_count: self.transaction_count,
      error_count: self.error_count,
    }
  }

  // Full immutable form for persistence. Full query texts are interned into shared_texts, which
  // is shared by every aggregate flushed in the same store() call.
  pub fn to_aggregate(
    &self,
    shared_texts: &mut SharedQueryTexts,
  ) -> Result<Aggregate, HistogramError> {
    Ok(Aggregate {
      total_duration_nanos: self.total_duration_nanos,
      transaction_count: self.transaction_count,
      error_count: self.error_count,
      async_transactions: self.async_transactions,
      main_thread_root_timers: to_snapshots(&self.main_thread_root_timers),
      aux_thread_root_timers: to_snapshots(&self.aux_thread_root_timers),
      async_timers: to_snapshots(&self.async_timers),
      main_thread_stats: self.main_thread_stats.to_snapshot(),
      aux_thread_stats: self.aux_thread_stats.to_snapshot(),
      duration_nanos_histogram: self.duration_nanos_histogram.to_encoded()?,
      queries_by_type: self.queries.to_queries_by_type(shared_texts),
      service_calls_by_type: self.service_calls.to_service_calls_by_type(),
      error_messages: self.error_messages.to_error_messages(),
      main_thread_profile: self.main_thread_profile.to_snapshot(),
      aux_thread_profile: self.aux_thread_profile.to_snapshot(),
    })
  }
}
