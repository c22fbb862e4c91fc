use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_config::quantity::{parse_cpu, parse_memory};
use loom_config::{Inputs, Outputs};

use crate::phase::NodePhase;
use crate::workflow::TemplateScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
  /// A leaf materialized as a pod (container, script or resource template).
  Pod,
  /// Wraps the attempts of a template with a retry strategy.
  Retry,
  Dag,
  Steps,
  StepGroup,
  /// The fan-out parent of a task or step with `withItems`/`withParam`.
  TaskGroup,
  Suspend,
}

impl NodeType {
  pub fn is_leaf(self) -> bool {
    self == NodeType::Pod
  }
}

/// Status of one node in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
  pub id: String,
  /// Full path from the root, e.g. `wf.B` or `wf[0].step(1:x)`.
  pub name: String,
  pub display_name: String,
  #[serde(rename = "type")]
  pub node_type: NodeType,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub template_name: String,
  #[serde(default, skip_serializing_if = "TemplateScope::is_local")]
  pub template_scope: TemplateScope,
  #[serde(default)]
  pub phase: NodePhase,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
  /// Nearest enclosing dag/steps node; parallelism caps are scoped to it.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub boundary_id: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub inputs: Option<Inputs>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Outputs>,
  /// Set once a pod create has been requested for this node.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pod_name: Option<String>,
  #[serde(default, skip_serializing_if = "ResourcesDuration::is_empty")]
  pub resources_duration: ResourcesDuration,
}

impl NodeStatus {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    display_name: impl Into<String>,
    node_type: NodeType,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      display_name: display_name.into(),
      node_type,
      template_name: String::new(),
      template_scope: TemplateScope::Local,
      phase: NodePhase::Pending,
      parent_id: None,
      boundary_id: None,
      children: Vec::new(),
      message: None,
      started_at: None,
      finished_at: None,
      inputs: None,
      outputs: None,
      pod_name: None,
      resources_duration: ResourcesDuration::default(),
    }
  }

  pub fn is_fulfilled(&self) -> bool {
    self.phase.is_fulfilled()
  }

  /// Move to `phase`, stamping timestamps. Moves that would leave a terminal
  /// phase or go backwards are refused and return false.
  pub fn transition(&mut self, phase: NodePhase, now: DateTime<Utc>) -> bool {
    if !self.phase.can_reach(phase) {
      return false;
    }
    if phase == self.phase {
      return true;
    }
    if phase != NodePhase::Pending && self.started_at.is_none() {
      self.started_at = Some(now);
    }
    if phase.is_fulfilled() && self.finished_at.is_none() {
      self.finished_at = Some(now);
    }
    self.phase = phase;
    true
  }

  /// Transition and replace the message in one go.
  pub fn finish(&mut self, phase: NodePhase, message: Option<String>, now: DateTime<Utc>) -> bool {
    let moved = self.transition(phase, now);
    if moved {
      self.message = message;
    }
    moved
  }

  pub fn exit_code(&self) -> Option<i32> {
    self.outputs.as_ref().and_then(|o| o.exit_code)
  }
}

/// Resource usage estimate in resource-seconds: `cpu` in core-seconds,
/// `memory` in (100Mi)-seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcesDuration(pub BTreeMap<String, i64>);

impl ResourcesDuration {
  const MEMORY_UNIT: f64 = 100.0 * 1024.0 * 1024.0;

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, resource: &str) -> i64 {
    self.0.get(resource).copied().unwrap_or(0)
  }

  pub fn add(&mut self, other: &ResourcesDuration) {
    for (resource, secs) in &other.0 {
      *self.0.entry(resource.clone()).or_default() += secs;
    }
  }

  /// Estimate usage from container requests held for `elapsed_secs`.
  /// Missing or unparsable requests count as one core and one memory unit.
  pub fn estimate(requests: &BTreeMap<String, String>, elapsed_secs: f64) -> Self {
    let cores = requests
      .get("cpu")
      .and_then(|q| parse_cpu(q).ok())
      .unwrap_or(1.0);
    let memory_units = requests
      .get("memory")
      .and_then(|q| parse_memory(q).ok())
      .map(|bytes| bytes / Self::MEMORY_UNIT)
      .unwrap_or(1.0);

    let elapsed = elapsed_secs.max(0.0);
    let mut usage = BTreeMap::new();
    usage.insert("cpu".to_string(), (cores * elapsed).ceil() as i64);
    usage.insert("memory".to_string(), (memory_units * elapsed).ceil() as i64);
    Self(usage)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
  }

  #[test]
  fn test_transition_stamps_times() {
    let mut node = NodeStatus::new("id", "wf.a", "a", NodeType::Pod);
    assert!(node.transition(NodePhase::Running, ts(10)));
    assert_eq!(node.started_at, Some(ts(10)));
    assert!(node.transition(NodePhase::Succeeded, ts(20)));
    assert_eq!(node.finished_at, Some(ts(20)));
    assert_eq!(node.started_at, Some(ts(10)));
  }

  #[test]
  fn test_transition_refuses_leaving_terminal() {
    let mut node = NodeStatus::new("id", "wf.a", "a", NodeType::Pod);
    assert!(node.finish(NodePhase::Failed, Some("boom".into()), ts(1)));
    assert!(!node.transition(NodePhase::Running, ts(2)));
    assert!(!node.finish(NodePhase::Succeeded, None, ts(3)));
    assert_eq!(node.phase, NodePhase::Failed);
    assert_eq!(node.message.as_deref(), Some("boom"));
  }

  #[test]
  fn test_pending_to_succeeded_sets_start() {
    let mut node = NodeStatus::new("id", "wf.a", "a", NodeType::Pod);
    assert!(node.transition(NodePhase::Succeeded, ts(5)));
    assert_eq!(node.started_at, Some(ts(5)));
    assert_eq!(node.finished_at, Some(ts(5)));
  }

  #[test]
  fn test_resources_estimate() {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), "500m".to_string());
    requests.insert("memory".to_string(), "200Mi".to_string());
    let usage = ResourcesDuration::estimate(&requests, 10.0);
    assert_eq!(usage.get("cpu"), 5);
    assert_eq!(usage.get("memory"), 20);

    let mut total = ResourcesDuration::default();
    total.add(&usage);
    total.add(&ResourcesDuration::estimate(&BTreeMap::new(), 3.0));
    assert_eq!(total.get("cpu"), 8);
    assert_eq!(total.get("memory"), 23);
  }
}
