// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./store_test.rs"]
mod store_test;

use crate::aggregate::query::QueryCollector;
use crate::aggregate::service_call::ServiceCallCollector;
use crate::model::{
  Aggregate,
  AggregateQuerySpec,
  AggregatesByType,
  OverallSummary,
  OverviewAggregate,
  PercentileAggregate,
  SummaryQuerySpec,
  ThroughputAggregate,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

//
// AggregateStore
//

// One stored aggregate handed to the rollup scheduler, carrying the shared text table it was
// persisted with so full query texts can be resolved during the merge.
#[derive(Clone, Debug)]
pub struct RollupRow {
  pub transaction_type: String,
  pub transaction_name: Option<String>,
  pub capture_time: i64,
  pub aggregate: Aggregate,
  pub shared_query_texts: Arc<Vec<String>>,
}

// Persistence boundary for aggregates at every rollup level.
//
// Range semantics are deliberately asymmetric and load bearing:
// - point-series reads (read_*_aggregates) treat query.from as INCLUSIVE, so a caller resuming
//   from a live result's initial capture time can pass that exact timestamp;
// - merge reads (merge_*_into, read_aggregates_for_rollup) treat from as NON-inclusive, so a
//   window already counted at `from` is never double merged.
//
// store() is an upsert keyed on (agent, level, type, name, capture_time), which is what makes
// rollup re-runs idempotent.
#[async_trait]
pub trait AggregateStore: Send + Sync {
  async fn store(
    &self,
    agent_rollup_id: &str,
    capture_time: i64,
    rollup_level: usize,
    shared_query_texts: Vec<String>,
    aggregates_by_type: Vec<AggregatesByType>,
  ) -> anyhow::Result<()>;

  async fn read_overview_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<OverviewAggregate>>;

  async fn read_percentile_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<PercentileAggregate>>;

  async fn read_throughput_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<ThroughputAggregate>>;

  async fn merge_overall_summary_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    summary: &mut OverallSummary,
  ) -> anyhow::Result<()>;

  async fn merge_queries_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut QueryCollector,
  ) -> anyhow::Result<()>;

  async fn merge_service_calls_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut ServiceCallCollector,
  ) -> anyhow::Result<()>;

  // Rows at rollup_level with capture time in (from, to], for the scheduler.
  async fn read_aggregates_for_rollup(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
    from: i64,
    to: i64,
  ) -> anyhow::Result<Vec<RollupRow>>;

  // Capture times persisted at rollup_level since the last call, consumed on read. The scheduler
  // uses these to re-roll boundaries whose finer windows landed late, after the boundary had
  // already been rolled up.
  async fn take_recent_capture_times(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
  ) -> anyhow::Result<Vec<i64>>;

  async fn agent_rollup_ids(&self) -> anyhow::Result<Vec<String>>;
}

//
// MemoryAggregateStore
//

#[derive(Clone, Debug)]
struct StoredRow {
  aggregate: Aggregate,
  shared_query_texts: Arc<Vec<String>>,
}

type SeriesKey = (String, Option<String>);

#[derive(Default)]
struct AgentData {
  // level -> series -> capture time -> row. BTreeMap keeps reads in ascending capture time order.
  levels: HashMap<usize, HashMap<SeriesKey, BTreeMap<i64, StoredRow>>>,
  // level -> capture times written since the scheduler last drained them.
  recent_capture_times: HashMap<usize, BTreeSet<i64>>,
}

// In-memory store for embedded deployments and tests.
#[derive(Default)]
pub struct MemoryAggregateStore {
  agents: RwLock<HashMap<String, AgentData>>,
}

impl MemoryAggregateStore {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  fn read_rows<T>(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
    convert: impl Fn(&Aggregate, i64) -> T,
  ) -> Vec<T> {
    let agents = self.agents.read();
    let Some(series) = agents.get(agent_rollup_id).and_then(|agent| {
      agent.levels.get(&query.rollup_level).and_then(|level| {
        level.get(&(
          query.transaction_type.clone(),
          query.transaction_name.clone(),
        ))
      })
    }) else {
      return Vec::new();
    };

    series
      .range((Bound::Included(query.from), Bound::Included(query.to)))
      .map(|(capture_time, row)| convert(&row.aggregate, *capture_time))
      .collect()
  }

  fn merge_rows(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    mut merge: impl FnMut(&StoredRow, i64),
  ) {
    let agents = self.agents.read();
    let Some(series) = agents.get(agent_rollup_id).and_then(|agent| {
      agent.levels.get(&query.rollup_level).and_then(|level| {
        level.get(&(
          query.transaction_type.clone(),
          query.transaction_name.clone(),
        ))
      })
    }) else {
      return;
    };

    for (capture_time, row) in series.range((Bound::Excluded(query.from), Bound::Included(query.to)))
    {
      merge(row, *capture_time);
    }
  }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
  async fn store(
    &self,
    agent_rollup_id: &str,
    capture_time: i64,
    rollup_level: usize,
    shared_query_texts: Vec<String>,
    aggregates_by_type: Vec<AggregatesByType>,
  ) -> anyhow::Result<()> {
    let shared_query_texts = Arc::new(shared_query_texts);
    let mut agents = self.agents.write();
    let agent = agents.entry(agent_rollup_id.to_string()).or_default();
    agent
      .recent_capture_times
      .entry(rollup_level)
      .or_default()
      .insert(capture_time);
    let level = agent.levels.entry(rollup_level).or_default();

    for by_type in aggregates_by_type {
      level
        .entry((by_type.transaction_type.clone(), None))
        .or_default()
        .insert(
          capture_time,
          StoredRow {
            aggregate: by_type.overall,
            shared_query_texts: shared_query_texts.clone(),
          },
        );
      for transaction in by_type.transactions {
        level
          .entry((
            by_type.transaction_type.clone(),
            Some(transaction.transaction_name),
          ))
          .or_default()
          .insert(
            capture_time,
            StoredRow {
              aggregate: transaction.aggregate,
              shared_query_texts: shared_query_texts.clone(),
            },
          );
      }
    }
    Ok(())
  }

  async fn read_overview_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<OverviewAggregate>> {
    Ok(self.read_rows(agent_rollup_id, query, Aggregate::to_overview_aggregate))
  }

  async fn read_percentile_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<PercentileAggregate>> {
    Ok(self.read_rows(agent_rollup_id, query, Aggregate::to_percentile_aggregate))
  }

  async fn read_throughput_aggregates(
    &self,
    agent_rollup_id: &str,
    query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<ThroughputAggregate>> {
    Ok(self.read_rows(agent_rollup_id, query, Aggregate::to_throughput_aggregate))
  }

  async fn merge_overall_summary_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    summary: &mut OverallSummary,
  ) -> anyhow::Result<()> {
    self.merge_rows(agent_rollup_id, query, |row, capture_time| {
      summary.merge(
        row.aggregate.total_duration_nanos,
        row.aggregate.transaction_count,
        capture_time,
      );
    });
    Ok(())
  }

  async fn merge_queries_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut QueryCollector,
  ) -> anyhow::Result<()> {
    self.merge_rows(agent_rollup_id, query, |row, _| {
      collector.merge_queries_by_type(&row.aggregate.queries_by_type, &row.shared_query_texts);
    });
    Ok(())
  }

  async fn merge_service_calls_into(
    &self,
    agent_rollup_id: &str,
    query: &SummaryQuerySpec,
    collector: &mut ServiceCallCollector,
  ) -> anyhow::Result<()> {
    self.merge_rows(agent_rollup_id, query, |row, _| {
      collector.merge_service_calls_by_type(&row.aggregate.service_calls_by_type);
    });
    Ok(())
  }

  async fn read_aggregates_for_rollup(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
    from: i64,
    to: i64,
  ) -> anyhow::Result<Vec<RollupRow>> {
    let agents = self.agents.read();
    let Some(level) = agents
      .get(agent_rollup_id)
      .and_then(|agent| agent.levels.get(&rollup_level))
    else {
      return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for ((transaction_type, transaction_name), series) in level {
      for (capture_time, row) in series.range((Bound::Excluded(from), Bound::Included(to))) {
        rows.push(RollupRow {
          transaction_type: transaction_type.clone(),
          transaction_name: transaction_name.clone(),
          capture_time: *capture_time,
          aggregate: row.aggregate.clone(),
          shared_query_texts: row.shared_query_texts.clone(),
        });
      }
    }
    Ok(rows)
  }

  async fn take_recent_capture_times(
    &self,
    agent_rollup_id: &str,
    rollup_level: usize,
  ) -> anyhow::Result<Vec<i64>> {
    let mut agents = self.agents.write();
    let Some(agent) = agents.get_mut(agent_rollup_id) else {
      return Ok(Vec::new());
    };
    Ok(
      agent
        .recent_capture_times
        .remove(&rollup_level)
        .map(|times| times.into_iter().collect())
        .unwrap_or_default(),
    )
  }

  async fn agent_rollup_ids(&self) -> anyhow::Result<Vec<String>> {
    let mut ids: Vec<_> = self.agents.read().keys().cloned().collect();
    ids.sort();
    Ok(ids)
  }
}
