// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

//
// Scope
//

// A named stats scope over a shared prometheus registry. Components create their counters and
// histograms through a scope so that every metric is prefixed with the component path.
#[derive(Clone)]
pub struct Scope {
  registry: Arc<Registry>,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn new(registry: Arc<Registry>, prefix: &str) -> Self {
    Self {
      registry,
      prefix: prefix.to_string(),
    }
  }

  // Create a child scope with an additional prefix segment.
  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      registry: self.registry.clone(),
      prefix: self.full_name(name),
    }
  }

  fn full_name(&self, name: &str) -> String {
    if self.prefix.is_empty() {
      name.to_string()
    } else {
      format!("{}_{name}", self.prefix)
    }
  }

  // Metric names are compile time constants so construction cannot fail. Duplicate registration
  // (e.g., two components built against the same scope path) keeps the first registered metric.
  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(self.full_name(name), name.to_string())).unwrap();
    let _ = self.registry.register(Box::new(counter.clone()));
    counter
  }

  #[must_use]
  pub fn histogram(&self, name: &str) -> Histogram {
    let histogram =
      Histogram::with_opts(HistogramOpts::new(self.full_name(name), name.to_string())).unwrap();
    let _ = self.registry.register(Box::new(histogram.clone()));
    histogram
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new(Arc::new(Registry::new()), "")
  }
}
