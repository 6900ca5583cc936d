// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use bytes::Bytes;
use strata_common::value::Value;

//
// TimerSnapshot
//

// An immutable timer tree node. Extended timers nest recursively via extension rather than a new
// stack frame, so children are keyed by (name, extended) rather than name alone.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerSnapshot {
  pub name: String,
  pub extended: bool,
  pub total_nanos: f64,
  pub count: i64,
  pub child_timers: Vec<TimerSnapshot>,
}

//
// ThreadStatsSnapshot
//

// Per-thread-group stats. None means "not available" from the underlying platform, which is
// distinct from zero and must survive merging.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ThreadStatsSnapshot {
  pub total_cpu_nanos: Option<f64>,
  pub total_blocked_nanos: Option<f64>,
  pub total_waited_nanos: Option<f64>,
  pub total_allocated_bytes: Option<f64>,
}

//
// ProfileNode
//

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileNode {
  pub frame: String,
  pub sample_count: i64,
  pub child_nodes: Vec<ProfileNode>,
}

//
// AggregateQuery
//

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateQuery {
  pub truncated_text: String,
  pub total_duration_nanos: f64,
  pub execution_count: i64,
  // None if any contributing execution could not report a row count.
  pub total_rows: Option<i64>,
  // Index into the shared query texts passed alongside store().
  pub full_text_index: Option<usize>,
}

// Totals evicted past a per-type limit. Counted separately from the retained entries so totals
// stay queryable after per-entry detail is dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OverflowSummary {
  pub total_duration_nanos: f64,
  pub execution_count: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueriesByType {
  pub query_type: String,
  // Ordered by total duration descending.
  pub queries: Vec<AggregateQuery>,
  pub overflow: Option<OverflowSummary>,
  pub more_available: bool,
}

//
// AggregateServiceCall
//

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateServiceCall {
  pub text: String,
  pub total_duration_nanos: f64,
  pub execution_count: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCallsByType {
  pub service_call_type: String,
  pub service_calls: Vec<AggregateServiceCall>,
  pub overflow: Option<OverflowSummary>,
  pub more_available: bool,
}

//
// ErrorMessages
//

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateErrorMessage {
  pub message: String,
  pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorMessages {
  // Ordered by count descending, ties by first occurrence.
  pub messages: Vec<AggregateErrorMessage>,
  // Counts folded out of evicted messages; never silently dropped.
  pub overflow_count: i64,
  pub more_available: bool,
}

//
// Aggregate
//

// The durable/wire unit: one window's accumulated state for one (transaction type, optional
// transaction name). Identified externally by (agent_rollup_id, transaction_type,
// transaction_name, capture_time) where capture_time is the window END.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
  pub total_duration_nanos: f64,
  pub transaction_count: i64,
  pub error_count: i64,
  pub async_transactions: bool,
  pub main_thread_root_timers: Vec<TimerSnapshot>,
  pub aux_thread_root_timers: Vec<TimerSnapshot>,
  pub async_timers: Vec<TimerSnapshot>,
  pub main_thread_stats: ThreadStatsSnapshot,
  pub aux_thread_stats: ThreadStatsSnapshot,
  // Compact histogram encoding, empty when the window saw no samples.
  pub duration_nanos_histogram: Bytes,
  pub queries_by_type: Vec<QueriesByType>,
  pub service_calls_by_type: Vec<ServiceCallsByType>,
  pub error_messages: ErrorMessages,
  pub main_thread_profile: Option<ProfileNode>,
  pub aux_thread_profile: Option<ProfileNode>,
}

impl Aggregate {
  #[must_use]
  pub fn to_overview_aggregate(&self, capture_time: i64) -> OverviewAggregate {
    OverviewAggregate {
      capture_time,
      total_duration_nanos: self.total_duration_nanos,
      transaction_count: self.transaction_count,
      async_transactions: self.async_transactions,
      main_thread_root_timers: self.main_thread_root_timers.clone(),
      aux_thread_root_timers: self.aux_thread_root_timers.clone(),
      async_timers: self.async_timers.clone(),
      main_thread_stats: self.main_thread_stats,
      aux_thread_stats: self.aux_thread_stats,
    }
  }

  #[must_use]
  pub fn to_percentile_aggregate(&self, capture_time: i64) -> PercentileAggregate {
    PercentileAggregate {
      capture_time,
      total_duration_nanos: self.total_duration_nanos,
      transaction_count: self.transaction_count,
      duration_nanos_histogram: self.duration_nanos_histogram.clone(),
    }
  }

  #[must_use]
  pub const fn to_throughput_aggregate(&self, capture_time: i64) -> ThroughputAggregate {
    ThroughputAggregate {
      capture_time,
      transaction_count: self.transaction_count,
      error_count: self.error_count,
    }
  }
}

//
// AggregatesByType
//

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionAggregate {
  pub transaction_name: String,
  pub aggregate: Aggregate,
}

// Per-transaction-type group as passed to AggregateStore::store(): the overall aggregate plus the
// bounded set of per-transaction-name aggregates.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatesByType {
  pub transaction_type: String,
  pub overall: Aggregate,
  pub transactions: Vec<TransactionAggregate>,
}

//
// TransactionEvent
//

#[derive(Clone, Debug, PartialEq)]
pub struct QueryObservation {
  pub query_type: String,
  pub truncated_text: String,
  pub full_text: Option<String>,
  pub duration_nanos: f64,
  pub execution_count: i64,
  pub total_rows: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCallObservation {
  pub service_call_type: String,
  pub text: String,
  pub duration_nanos: f64,
  pub execution_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorInfo {
  pub message: String,
  pub detail: Option<Value>,
}

const MAX_ERROR_MESSAGE_LENGTH: usize = 512;
const MAX_ERROR_DETAIL_STRING_LENGTH: usize = 256;
const MAX_ERROR_DETAIL_COLLECTION_LENGTH: usize = 100;
const MAX_ERROR_DETAIL_DEPTH: u32 = 8;

impl ErrorInfo {
  // Error payloads come from untrusted instrumentation and can be arbitrarily large. Bound them
  // before aggregation so a single pathological error cannot bloat a window.
  #[must_use]
  pub fn bounded(&self) -> Self {
    let mut message = self.message.clone();
    if message.len() > MAX_ERROR_MESSAGE_LENGTH {
      let mut end = MAX_ERROR_MESSAGE_LENGTH;
      while !message.is_char_boundary(end) {
        end -= 1;
      }
      message.truncate(end);
    }
    Self {
      message,
      detail: self.detail.as_ref().map(|detail| {
        detail.truncate(
          MAX_ERROR_DETAIL_STRING_LENGTH,
          MAX_ERROR_DETAIL_COLLECTION_LENGTH,
          MAX_ERROR_DETAIL_DEPTH,
        )
      }),
    }
  }
}

// One completed transaction as delivered by the transaction pipeline. capture_time is the
// completion time in unix millis; it decides window membership.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionEvent {
  pub transaction_type: String,
  pub transaction_name: String,
  pub capture_time: i64,
  pub duration_nanos: i64,
  pub error: Option<ErrorInfo>,
  pub async_transaction: bool,
  pub main_thread_root_timers: Vec<TimerSnapshot>,
  pub aux_thread_root_timers: Vec<TimerSnapshot>,
  pub async_timers: Vec<TimerSnapshot>,
  pub main_thread_stats: ThreadStatsSnapshot,
  // None when the transaction had no auxiliary threads; does not poison aux stats.
  pub aux_thread_stats: Option<ThreadStatsSnapshot>,
  pub queries: Vec<QueryObservation>,
  pub service_calls: Vec<ServiceCallObservation>,
  pub main_thread_profile: Option<ProfileNode>,
  pub aux_thread_profile: Option<ProfileNode>,
}

//
// Read views
//

#[derive(Clone, Debug, PartialEq)]
pub struct OverviewAggregate {
  pub capture_time: i64,
  pub total_duration_nanos: f64,
  pub transaction_count: i64,
  pub async_transactions: bool,
  pub main_thread_root_timers: Vec<TimerSnapshot>,
  pub aux_thread_root_timers: Vec<TimerSnapshot>,
  pub async_timers: Vec<TimerSnapshot>,
  pub main_thread_stats: ThreadStatsSnapshot,
  pub aux_thread_stats: ThreadStatsSnapshot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PercentileAggregate {
  pub capture_time: i64,
  pub total_duration_nanos: f64,
  pub transaction_count: i64,
  pub duration_nanos_histogram: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThroughputAggregate {
  pub capture_time: i64,
  pub transaction_count: i64,
  pub error_count: i64,
}

// Read views are stitched across windows by ascending capture time.
pub trait CapturePoint {
  fn capture_time(&self) -> i64;
}

impl CapturePoint for OverviewAggregate {
  fn capture_time(&self) -> i64 {
    self.capture_time
  }
}

impl CapturePoint for PercentileAggregate {
  fn capture_time(&self) -> i64 {
    self.capture_time
  }
}

impl CapturePoint for ThroughputAggregate {
  fn capture_time(&self) -> i64 {
    self.capture_time
  }
}

//
// LiveResult
//

// Non-null live data: per-window values in ascending capture time order plus the first window's
// capture time, which callers use to bound the storage read they merge underneath.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveResult<T> {
  pub values: Vec<T>,
  pub initial_capture_time: i64,
}

//
// Query specs
//

// Point-series read spec. from is INCLUSIVE.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateQuerySpec {
  pub transaction_type: String,
  pub transaction_name: Option<String>,
  pub from: i64,
  pub to: i64,
  pub rollup_level: usize,
}

// Merge-summary read spec. from is NON-INCLUSIVE. The asymmetry with AggregateQuerySpec is a
// load-bearing storage contract; see AggregateStore.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryQuerySpec {
  pub transaction_type: String,
  pub transaction_name: Option<String>,
  pub from: i64,
  pub to: i64,
  pub rollup_level: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OverallSummary {
  pub total_duration_nanos: f64,
  pub transaction_count: i64,
  pub last_capture_time: i64,
}

impl OverallSummary {
  pub fn merge(&mut self, total_duration_nanos: f64, transaction_count: i64, capture_time: i64) {
    self.total_duration_nanos += total_duration_nanos;
    self.transaction_count += transaction_count;
    self.last_capture_time = self.last_capture_time.max(capture_time);
  }
}
