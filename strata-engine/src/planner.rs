// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./planner_test.rs"]
mod planner_test;

use crate::aggregate::query::QueryCollector;
use crate::aggregate::service_call::ServiceCallCollector;
use crate::model::{
  AggregateQuerySpec,
  AggregatesByType,
  CapturePoint,
  OverallSummary,
  OverviewAggregate,
  PercentileAggregate,
  SummaryQuerySpec,
  ThroughputAggregate,
};
use crate::store::{AggregateStore, RollupRow};
use async_trait::async_trait;
use prometheus::IntCounter;
use std::sync::Arc;
use strata_common::stats::Scope;

//
// EpochCutover
//

// Splits history at a configured timestamp: everything at or before the cutover lives in the
// legacy store, everything after it in the current store. Writes always go to current, so the
// cutover must not move forward once data lands past it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochCutover {
  pub cutover: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPlan {
  Legacy,
  Current,
  // Sub-range splits keep each side's from/to semantics: for point reads current starts at
  // cutover + 1 (inclusive from), for merge reads at cutover (non-inclusive from).
  Split,
}

impl EpochCutover {
  #[must_use]
  pub const fn new(cutover: i64) -> Self {
    Self { cutover }
  }

  #[must_use]
  pub const fn plan(&self, from: i64, to: i64) -> QueryPlan {
    if to <= self.cutover {
      QueryPlan::Legacy
    } else if from > self.cutover {
      QueryPlan::Current
    } else {
      QueryPlan::Split
    }
  }
}

// Stitch two per-epoch point series into one. Every legacy capture time is <= the cutover and
// every current capture time is past it, so plain concatenation preserves ascending order.
#[must_use]
pub fn concat_point_series<T: CapturePoint>(legacy: Vec<T>, mut current: Vec<T>) -> Vec<T> {
  debug_assert!(
    legacy.last().map(CapturePoint::capture_time) <= current.first().map(CapturePoint::capture_time)
      || current.is_empty()
  );
  let mut values = legacy;
  values.append(&mut current);
  values
}

//
// EpochSplitStore
//

struct Stats {
  partial_reads_total: IntCounter,
}

// AggregateStore over a legacy and a current store. Reads fan out per the cutover plan; if one
// side of a split read fails, the other side's records are still returned and the miss is
// surfaced through the partial_reads counter and log rather than failing the whole query.
// Rollup bookkeeping (read_aggregates_for_rollup, agent_rollup_ids) only consults the current
// store: the legacy epoch is frozen and its rollups were completed before the cutover.
pub struct EpochSplitStore {
  cutover: EpochCutover,
  legacy: Arc<dyn AggregateStore>,
  current: Arc<dyn AggregateStore>,
  stats: Stats,
}

impl EpochSplitStore {
  #[must_use]
  pub fn new(
    cutover: EpochCutover,
    legacy: Arc<dyn AggregateStore>,
    current: Arc<dyn AggregateStore>,
    scope: &Scope,
  ) -> Self {
    Self {
      cutover,
      legacy,
      current,
      stats: Stats {
        partial_reads_total: scope.scope("planner").counter("partial_reads_total"),
      },
    }
  }

  // Sub-queries for a split point read: legacy keeps its inclusive from, current resumes one
  // past the cutover because its from is also inclusive.
  fn split_point_specs(&self, query: &AggregateQuerySpec) -> (AggregateQuerySpec, AggregateQuerySpec) {
    (
      AggregateQuerySpec {
        to: self.cutover.cutover,
        ..query.clone()
      },
      AggregateQuerySpec {
        from: self.cutover.cutover + 1,
        ..query.clone()
      },
    )
  }

  // Merge reads treat from as non-inclusive, so the current side starts exactly at the cutover.
  fn split_summary_specs(&self, query: &SummaryQuerySpec) -> (SummaryQuerySpec, SummaryQuerySpec) {
    (
      SummaryQuerySpec {
        to: self.cutover.cutover,
        ..query.clone()
      },
      SummaryQuerySpec {
        from: self.cutover.cutover,
        ..query.clone()
      },
    )
  }

  // Stitch a split point read back together. The bool marks a partial result where one epoch was
  // unreadable; both epochs failing fails the query.
  fn combine_point_series<T: CapturePoint>(
    &self,
    legacy: anyhow::Result<Vec<T>>,
    current: anyhow::Result<Vec<T>>,
  ) -> anyhow::Result<(Vec<T>, bool)> {
    match (legacy, current) {
      (Ok(legacy), Ok(current)) => Ok((concat_point_series(legacy, current), false)),
      (Ok(legacy), Err(e)) => {
        self.partial("current", &e);
        Ok((legacy, true))
      },
      (Err(e), Ok(current)) => {
        self.partial("legacy", &e);
        Ok((current, true))
      },
      (Err(e), Err(_)) => Err(e),
    }
  }

  fn combine_merge(
    &self,
    legacy: anyhow::Result<()>,
    current: anyhow::Result<()>,
  ) -> anyhow::Result<bool> {
    match (legacy, current) {
      (Ok(()), Ok(())) => Ok(false),
      (Ok(()), Err(e)) => {
        self.partial("current", &e);
        Ok(true)
      },
      (Err(e), Ok(())) => {
        self.partial("legacy", &e);
        Ok(true)
      },
      (Err(e), Err(_)) => Err(e),
    }
  }

  pub async fn read_overview_aggregates_partial(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<(Vec<OverviewAggregate>, bool)> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => Ok((
        self.legacy.read_overview_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Current => Ok((
        self.current.read_overview_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_point_specs(query);
        let legacy = self
          .legacy
          .read_overview_aggregates(agent_rollup_id, &legacy_query)
          .await;
        let current = self
          .current
          .read_overview_aggregates(agent_rollup_id, &current_query)
          .await;
        self.combine_point_series(legacy, current)
      },
    }
  }

  pub async fn read_percentile_aggregates_partial(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<(Vec<PercentileAggregate>, bool)> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => Ok((
        self.legacy.read_percentile_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Current => Ok((
        self.current.read_percentile_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_point_specs(query);
        let legacy = self
          .legacy
          .read_percentile_aggregates(agent_rollup_id, &legacy_query)
          .await;
        let current = self
          .current
          .read_percentile_aggregates(agent_rollup_id, &current_query)
          .await;
        self.combine_point_series(legacy, current)
      },
    }
  }

  pub async fn read_throughput_aggregates_partial(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<(Vec<ThroughputAggregate>, bool)> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => Ok((
        self.legacy.read_throughput_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Current => Ok((
        self.current.read_throughput_aggregates(agent_rollup_id, query).await?,
        false,
      )),
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_point_specs(query);
        let legacy = self
          .legacy
          .read_throughput_aggregates(agent_rollup_id, &legacy_query)
          .await;
        let current = self
          .current
          .read_throughput_aggregates(agent_rollup_id, &current_query)
          .await;
        self.combine_point_series(legacy, current)
      },
    }
  }

  fn partial(&self, side: &str, e: &anyhow::Error) {
    log::warn!("split read missing {side} epoch, returning partial results: {e}");
    self.stats.partial_reads_total.inc();
  }
}

#[async_trait]
impl AggregateStore for EpochSplitStore {
  async fn store(
    &self,
    agent_rollup_id: &str,
    capture_time: i64,
    rollup_level: usize,
    shared_query_texts: Vec<String>,
    aggregates_by_type: Vec<AggregatesByType>,
  ) -> anyhow::Result<()> {
    self
      .current
      .store(
        agent_rollup_id,
        capture_time,
        rollup_level,
        shared_query_texts,
        aggregates_by_type,
      )
      .await
  }

  async fn read_overview_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<OverviewAggregate>> {
    // Trait callers get the stitched series; dashboards that surface partial data use the
    // *_partial variants directly.
    let (values, _) = self
      .read_overview_aggregates_partial(agent_rollup_id, query)
      .await?;
    Ok(values)
  }

  async fn read_percentile_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<PercentileAggregate>> {
    // Trait callers get the stitched series; dashboards that surface partial data use the
    // *_partial variants directly.
    let (values, _) = self
      .read_percentile_aggregates_partial(agent_rollup_id, query)
      .await?;
    Ok(values)
  }

  async fn read_throughput_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<ThroughputAggregate>> {
    // Trait callers get the stitched series; dashboards that surface partial data use the
    // *_partial variants directly.
    let (values, _) = self
      .read_throughput_aggregates_partial(agent_rollup_id, query)
      .await?;
    Ok(values)
  }

  async fn merge_overall_summary_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    summary: &mut OverallSummary,
  ) -> anyhow::Result<()> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => {
        self
          .legacy
          .merge_overall_summary_into(agent_rollup_id, query, summary)
          .await
      },
      QueryPlan::Current => {
        self
          .current
          .merge_overall_summary_into(agent_rollup_id, query, summary)
          .await
      },
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_summary_specs(query);
        let legacy = self
          .legacy
          .merge_overall_summary_into(agent_rollup_id, &legacy_query, summary)
          .await;
        let current = self
          .current
          .merge_overall_summary_into(agent_rollup_id, &current_query, summary)
          .await;
        self.combine_merge(legacy, current).map(|_| ())
      },
    }
  }

  async fn merge_queries_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut QueryCollector,
  ) -> anyhow::Result<()> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => self.legacy.merge_queries_into(agent_rollup_id, query, collector).await,
      QueryPlan::Current => {
        self.current.merge_queries_into(agent_rollup_id, query, collector).await
      },
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_summary_specs(query);
        let legacy = self
          .legacy
          .merge_queries_into(agent_rollup_id, &legacy_query, collector)
          .await;
        let current = self
          .current
          .merge_queries_into(agent_rollup_id, &current_query, collector)
          .await;
        self.combine_merge(legacy, current).map(|_| ())
      },
    }
  }

  async fn merge_service_calls_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut ServiceCallCollector,
  ) -> anyhow::Result<()> {
    match self.cutover.plan(query.from, query.to) {
      QueryPlan::Legacy => {
        self
          .legacy
          .merge_service_calls_into(agent_rollup_id, query, collector)
          .await
      },
      QueryPlan::Current => {
        self
          .current
          .merge_service_calls_into(agent_rollup_id, query, collector)
          .await
      },
      QueryPlan::Split => {
        let (legacy_query, current_query) = self.split_summary_specs(query);
        let legacy = self
          .legacy
          .merge_service_calls_into(agent_rollup_id, &legacy_query, collector)
          .await;
        let current = self
          .current
          .merge_service_calls_into(agent_rollup_id, &current_query, collector)
          .await;
        self.combine_merge(legacy, current).map(|_| ())
      },
    }
  }

  async fn read_aggregates_for_rollup(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
    from: i64,
    to: i64,
  ) -> anyhow::Result<Vec<RollupRow>> {
    self
      .current
      .read_aggregates_for_rollup(agent_rollup_id, rollup_level, from, to)
      .await
  }

  async fn take_recent_capture_times(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
  ) -> anyhow::Result<Vec<i64>> {
    self
      .current
      .take_recent_capture_times(agent_rollup_id, rollup_level)
      .await
  }

  async fn agent_rollup_ids(&self) -> anyhow::Result<Vec<String>> {
    self.current.agent_rollup_ids().await
  }
}
