// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{EpochCutover, EpochSplitStore, QueryPlan};
use crate::aggregate::MutableAggregate;
use crate::aggregate::query::{QueryCollector, SharedQueryTexts};
use crate::config::CollectorLimits;
use crate::model::{
  AggregateQuerySpec,
  AggregatesByType,
  OverallSummary,
  SummaryQuerySpec,
  TransactionEvent,
};
use crate::store::{AggregateStore, MemoryAggregateStore, RollupRow};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use strata_common::stats::Scope;

const MINUTE: i64 = 60_000;
const CUTOVER: i64 = 5 * MINUTE;

struct ErrorStore {}

#[async_trait]
impl AggregateStore for ErrorStore {
  async fn store(
    &self,
    _agent_rollup_id: &str,
    _capture_time: i64,
    _rollup_level: usize,
    _shared_query_texts: Vec<String>,
    _aggregates_by_type: Vec<AggregatesByType>,
  ) -> anyhow::Result<()> {
    anyhow::bail!("store offline")
  }

  async fn read_overview_aggregates(
    &self,
    _agent_rollup_id: &str,
    _query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<crate::model::OverviewAggregate>> {
    anyhow::bail!("store offline")
  }

  async fn read_percentile_aggregates(
    &self,
    _agent_rollup_id: &str,
    _query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<crate::model::PercentileAggregate>> {
    anyhow::bail!("store offline")
  }

  async fn read_throughput_aggregates(
    &self,
    _agent_rollup_id: &str,
    _query: &AggregateQuerySpec,
  ) -> anyhow::Result<Vec<crate::model::ThroughputAggregate>> {
    anyhow::bail!("store offline")
  }

  async fn merge_overall_summary_into(
    &self,
    _agent_rollup_id: &str,
    _query: &SummaryQuerySpec,
    _summary: &mut OverallSummary,
  ) -> anyhow::Result<()> {
    anyhow::bail!("store offline")
  }

  async fn merge_queries_into(
    &self,
    _agent_rollup_id: &str,
    _query: &SummaryQuerySpec,
    _collector: &mut QueryCollector,
  ) -> anyhow::Result<()> {
    anyhow::bail!("store offline")
  }

  async fn merge_service_calls_into(
    &self,
    _agent_rollup_id: &str,
    _query: &SummaryQuerySpec,
    _collector: &mut crate::aggregate::service_call::ServiceCallCollector,
  ) -> anyhow::Result<()> {
    anyhow::bail!("store offline")
  }

  async fn read_aggregates_for_rollup(
    &self,
    _agent_rollup_id: &str,
    _rollup_level: usize,
    _from: i64,
    _to: i64,
  ) -> anyhow::Result<Vec<RollupRow>> {
    anyhow::bail!("store offline")
  }

  async fn take_recent_capture_times(
    &self,
    _agent_rollup_id: &str,
    _rollup_level: usize,
  ) -> anyhow::Result<Vec<i64>> {
    anyhow::bail!("store offline")
  }

  async fn agent_rollup_ids(&self) -> anyhow::Result<Vec<String>> {
    anyhow::bail!("store offline")
  }
}

fn aggregates(query_text: &str) -> Vec<AggregatesByType> {
  let mut overall = MutableAggregate::new(&CollectorLimits::default());
  overall.add_transaction(&TransactionEvent {
    transaction_type: "Web".to_string(),
    transaction_name: "/home".to_string(),
    duration_nanos: 1_000_000,
    queries: vec![crate::model::QueryObservation {
      query_type: "SQL".to_string(),
      truncated_text: query_text.to_string(),
      full_text: None,
      duration_nanos: 500.0,
      execution_count: 1,
      total_rows: Some(1),
    }],
    ..Default::default()
  });
  vec![AggregatesByType {
    transaction_type: "Web".to_string(),
    overall: overall.to_aggregate(&mut SharedQueryTexts::default()).unwrap(),
    transactions: vec![],
  }]
}

async fn seed(store: &dyn AggregateStore, minutes: std::ops::RangeInclusive<i64>) {
  for minute in minutes {
    store
      .store(
        "agent",
        minute * MINUTE,
        0,
        vec![],
        aggregates(&format!("select {minute}")),
      )
      .await
      .unwrap();
  }
}

fn point_query(from: i64, to: i64) -> AggregateQuerySpec {
  AggregateQuerySpec {
    transaction_type: "Web".to_string(),
    transaction_name: None,
    from,
    to,
    rollup_level: 0,
  }
}

#[test]
fn plans_by_range_position() {
  let cutover = EpochCutover::new(CUTOVER);
  assert_eq!(QueryPlan::Legacy, cutover.plan(0, CUTOVER));
  assert_eq!(QueryPlan::Current, cutover.plan(CUTOVER + 1, 10 * MINUTE));
  assert_eq!(QueryPlan::Split, cutover.plan(0, 10 * MINUTE));
  assert_eq!(QueryPlan::Split, cutover.plan(CUTOVER, CUTOVER + 1));
}

#[tokio::test]
async fn split_reads_match_an_unsplit_store() {
  let unsplit = MemoryAggregateStore::new();
  seed(&unsplit, 1 ..= 10).await;

  let legacy = Arc::new(MemoryAggregateStore::new());
  let current = Arc::new(MemoryAggregateStore::new());
  seed(legacy.as_ref(), 1 ..= 5).await;
  seed(current.as_ref(), 6 ..= 10).await;
  let split = EpochSplitStore::new(
    EpochCutover::new(CUTOVER),
    legacy,
    current,
    &Scope::default(),
  );

  let query = point_query(MINUTE, 10 * MINUTE);
  assert_eq!(
    unsplit
      .read_throughput_aggregates("agent", &query)
      .await
      .unwrap(),
    split
      .read_throughput_aggregates("agent", &query)
      .await
      .unwrap()
  );
  assert_eq!(
    unsplit
      .read_overview_aggregates("agent", &query)
      .await
      .unwrap(),
    split.read_overview_aggregates("agent", &query).await.unwrap()
  );

  let summary_query = SummaryQuerySpec {
    transaction_type: "Web".to_string(),
    transaction_name: None,
    from: 0,
    to: 10 * MINUTE,
    rollup_level: 0,
  };
  let mut unsplit_summary = OverallSummary::default();
  unsplit
    .merge_overall_summary_into("agent", &summary_query, &mut unsplit_summary)
    .await
    .unwrap();
  let mut split_summary = OverallSummary::default();
  split
    .merge_overall_summary_into("agent", &summary_query, &mut split_summary)
    .await
    .unwrap();
  assert_eq!(unsplit_summary, split_summary);

  let mut unsplit_queries = QueryCollector::new(500);
  unsplit
    .merge_queries_into("agent", &summary_query, &mut unsplit_queries)
    .await
    .unwrap();
  let mut split_queries = QueryCollector::new(500);
  split
    .merge_queries_into("agent", &summary_query, &mut split_queries)
    .await
    .unwrap();
  assert_eq!(
    unsplit_queries.to_queries_by_type(&mut SharedQueryTexts::default()),
    split_queries.to_queries_by_type(&mut SharedQueryTexts::default())
  );
}

#[tokio::test]
async fn one_sided_failure_returns_partial_results() {
  let current = Arc::new(MemoryAggregateStore::new());
  seed(current.as_ref(), 6 ..= 10).await;
  let split = EpochSplitStore::new(
    EpochCutover::new(CUTOVER),
    Arc::new(ErrorStore {}),
    current,
    &Scope::default(),
  );

  let (values, partial) = split
    .read_throughput_aggregates_partial("agent", &point_query(MINUTE, 10 * MINUTE))
    .await
    .unwrap();
  assert!(partial);
  assert_eq!(5, values.len());
  assert_eq!(6 * MINUTE, values[0].capture_time);

  // An unsplit range never reports partial.
  let (values, partial) = split
    .read_throughput_aggregates_partial("agent", &point_query(CUTOVER + 1, 10 * MINUTE))
    .await
    .unwrap();
  assert!(!partial);
  assert_eq!(5, values.len());

  // The trait surface still serves the stitched values.
  assert_eq!(
    5,
    split
      .read_throughput_aggregates("agent", &point_query(MINUTE, 10 * MINUTE))
      .await
      .unwrap()
      .len()
  );

  // A fully legacy range has no current side to fall back on.
  assert!(
    split
      .read_throughput_aggregates("agent", &point_query(MINUTE, CUTOVER))
      .await
      .is_err()
  );
}

#[tokio::test]
async fn writes_route_to_the_current_store() {
  let current = Arc::new(MemoryAggregateStore::new());
  let split = EpochSplitStore::new(
    EpochCutover::new(CUTOVER),
    Arc::new(ErrorStore {}),
    current.clone(),
    &Scope::default(),
  );

  split
    .store("agent", 6 * MINUTE, 0, vec![], aggregates("select 6"))
    .await
    .unwrap();
  assert_eq!(
    1,
    current
      .read_throughput_aggregates("agent", &point_query(6 * MINUTE, 6 * MINUTE))
      .await
      .unwrap()
      .len()
  );
}
