// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./error_message_test.rs"]
mod error_message_test;

use crate::model::{AggregateErrorMessage, ErrorMessages};
use std::collections::HashMap;

//
// ErrorMessageCollector
//

#[derive(Debug)]
struct ErrorEntry {
  count: i64,
  // Order of first appearance, used as the tie breaker for equal counts.
  first_seen: u64,
}

// Bounded error message accumulator ranked by count descending, ties broken by first-seen order.
// Counts evicted past the limit accumulate in overflow_count.
#[derive(Debug)]
pub struct ErrorMessageCollector {
  limit: usize,
  messages: HashMap<String, ErrorEntry>,
  next_seen: u64,
  overflow_count: i64,
  more_available: bool,
}

impl ErrorMessageCollector {
  #[must_use]
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      messages: HashMap::new(),
      next_seen: 0,
      overflow_count: 0,
      more_available: false,
    }
  }

  pub fn merge_error(&mut self, message: &str, count: i64) {
    if let Some(entry) = self.messages.get_mut(message) {
      entry.count += count;
      return;
    }

    let first_seen = self.next_seen;
    self.next_seen += 1;
    self.messages.insert(
      message.to_string(),
      ErrorEntry { count, first_seen },
    );
    if self.messages.len() > self.limit * 2 {
      self.compress();
    }
  }

  pub fn merge_error_messages(&mut self, error_messages: &ErrorMessages) {
    for message in &error_messages.messages {
      self.merge_error(&message.message, message.count);
    }
    if error_messages.overflow_count > 0 {
      self.more_available = true;
      self.overflow_count += error_messages.overflow_count;
    }
    if error_messages.more_available {
      self.more_available = true;
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.messages.is_empty() && self.overflow_count == 0
  }

  #[must_use]
  pub fn to_error_messages(&self) -> ErrorMessages {
    let mut entries: Vec<_> = self.messages.iter().collect();
    entries.sort_by(|a, b| {
      b.1
        .count
        .cmp(&a.1.count)
        .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
    });

    let mut more_available = self.more_available;
    let mut overflow_count = self.overflow_count;
    if entries.len() > self.limit {
      more_available = true;
      for (_, entry) in entries.drain(self.limit ..) {
        overflow_count += entry.count;
      }
    }

    ErrorMessages {
      messages: entries
        .into_iter()
        .map(|(message, entry)| AggregateErrorMessage {
          message: message.clone(),
          count: entry.count,
        })
        .collect(),
      overflow_count,
      more_available,
    }
  }

  fn compress(&mut self) {
    self.more_available = true;
    let mut entries: Vec<_> = self.messages.drain().collect();
    entries.sort_by(|a, b| {
      b.1
        .count
        .cmp(&a.1.count)
        .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
    });
    for (_, evicted) in entries.drain(self.limit ..) {
      self.overflow_count += evicted.count;
    }
    self.messages = entries.into_iter().collect();
  }
}
