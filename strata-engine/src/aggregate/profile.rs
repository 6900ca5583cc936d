// strata - bitdrift's telemetry rollup engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./profile_test.rs"]
mod profile_test;

use crate::model::ProfileNode;

// Caps enforced during merge so reads stay bounded. Frames past the depth cap fold their sample
// counts into the deepest retained ancestor; once the node cap is hit new frames fold into their
// parent instead of creating nodes.
pub const MAX_PROFILE_DEPTH: usize = 256;
pub const MAX_PROFILE_NODES: usize = 10_000;

//
// MutableProfile
//

#[derive(Debug)]
struct MutableProfileNode {
  frame: String,
  sample_count: i64,
  child_nodes: Vec<MutableProfileNode>,
}

impl MutableProfileNode {
  fn to_snapshot(&self) -> ProfileNode {
    ProfileNode {
      frame: self.frame.clone(),
      sample_count: self.sample_count,
      child_nodes: self
        .child_nodes
        .iter()
        .map(MutableProfileNode::to_snapshot)
        .collect(),
    }
  }
}

// An aggregated stack trace profile. Roots from many transactions merge frame by frame.
#[derive(Debug, Default)]
pub struct MutableProfile {
  roots: Vec<MutableProfileNode>,
  node_count: usize,
}

impl MutableProfile {
  pub fn merge_profile(&mut self, profile: &ProfileNode) {
    let mut roots = std::mem::take(&mut self.roots);
    let dropped = Self::merge_node(profile, &mut roots, 1, &mut self.node_count);
    if dropped > 0 {
      // A brand new root frame past the node budget has no parent to absorb its samples.
      log::debug!("profile node budget exhausted, dropped {dropped} root samples");
    }
    self.roots = roots;
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }

  // Single root output: a profile with one root returns it directly, multiple roots are wrapped
  // under a synthetic empty frame.
  #[must_use]
  pub fn to_snapshot(&self) -> Option<ProfileNode> {
    match self.roots.len() {
      0 => None,
      1 => Some(self.roots[0].to_snapshot()),
      _ => Some(ProfileNode {
        frame: String::new(),
        sample_count: self.roots.iter().map(|r| r.sample_count).sum(),
        child_nodes: self
          .roots
          .iter()
          .map(MutableProfileNode::to_snapshot)
          .collect(),
      }),
    }
  }

  // Returns the subtree samples that could not be placed because the node budget was exhausted,
  // so the caller can fold them into the parent frame's count.
  fn merge_node(
    node: &ProfileNode,
    into: &mut Vec<MutableProfileNode>,
    depth: usize,
    node_count: &mut usize,
  ) -> i64 {
    let existing = into.iter().position(|n| n.frame == node.frame);
    let index = match existing {
      Some(index) => index,
      None => {
        if *node_count >= MAX_PROFILE_NODES {
          return subtree_samples(node);
        }
        *node_count += 1;
        into.push(MutableProfileNode {
          frame: node.frame.clone(),
          sample_count: 0,
          child_nodes: Vec::new(),
        });
        into.len() - 1
      },
    };

    let target = &mut into[index];
    if depth >= MAX_PROFILE_DEPTH {
      target.sample_count += subtree_samples(node);
      return 0;
    }
    target.sample_count += node.sample_count;
    let mut child_nodes = std::mem::take(&mut target.child_nodes);
    let mut folded = 0;
    for child in &node.child_nodes {
      folded += Self::merge_node(child, &mut child_nodes, depth + 1, node_count);
    }
    let target = &mut into[index];
    target.child_nodes = child_nodes;
    target.sample_count += folded;
    0
  }
}

fn subtree_samples(node: &ProfileNode) -> i64 {
  node.sample_count + node.child_nodes.iter().map(subtree_samples).sum::<i64>()
}
