use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_config::{Template, WorkflowSpec};

use crate::node::{NodeStatus, ResourcesDuration};
use crate::phase::WorkflowPhase;

/// The mutable part of a workflow, written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
  #[serde(default)]
  pub phase: WorkflowPhase,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default, skip_serializing_if = "Nodes::is_empty")]
  pub nodes: Nodes,
  /// Templates frozen at initialisation, keyed by [`crate::stored_template_key`].
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub stored_templates: BTreeMap<String, Template>,
  #[serde(default, skip_serializing_if = "ResourcesDuration::is_empty")]
  pub resources_duration: ResourcesDuration,
  /// The spec merged with its `workflowTemplateRef`, when it has one.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stored_workflow_spec: Option<Box<WorkflowSpec>>,
}

/// The node tree as a flat map keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nodes(BTreeMap<String, NodeStatus>);

impl Nodes {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn get(&self, id: &str) -> Option<&NodeStatus> {
    self.0.get(id)
  }

  pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeStatus> {
    self.0.get_mut(id)
  }

  pub fn contains(&self, id: &str) -> bool {
    self.0.contains_key(id)
  }

  pub fn insert(&mut self, node: NodeStatus) {
    self.0.insert(node.id.clone(), node);
  }

  pub fn iter(&self) -> impl Iterator<Item = &NodeStatus> {
    self.0.values()
  }

  pub fn by_name(&self, name: &str) -> Option<&NodeStatus> {
    self.0.values().find(|n| n.name == name)
  }

  /// Children of `id` in insertion order.
  pub fn children(&self, id: &str) -> Vec<&NodeStatus> {
    self
      .get(id)
      .map(|n| n.children.iter().filter_map(|c| self.get(c)).collect())
      .unwrap_or_default()
  }

  /// Whether `ancestor` appears on the parent chain of `id`.
  pub fn is_descendant_of(&self, id: &str, ancestor: &str) -> bool {
    let mut current = self.get(id).and_then(|n| n.parent_id.as_deref());
    while let Some(parent) = current {
      if parent == ancestor {
        return true;
      }
      current = self.get(parent).and_then(|n| n.parent_id.as_deref());
    }
    false
  }

  /// Attach `child` under `parent` unless already attached.
  pub fn link(&mut self, parent: &str, child: &str) {
    if let Some(node) = self.0.get_mut(parent)
      && !node.children.iter().any(|c| c == child)
    {
      node.children.push(child.to_string());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::NodeType;
  use crate::phase::NodePhase;

  #[test]
  fn test_link_and_descend() {
    let mut nodes = Nodes::default();
    nodes.insert(NodeStatus::new("root", "wf", "wf", NodeType::Dag));
    let mut a = NodeStatus::new("a", "wf.a", "a", NodeType::Retry);
    a.parent_id = Some("root".into());
    nodes.insert(a);
    let mut a0 = NodeStatus::new("a0", "wf.a(0)", "a(0)", NodeType::Pod);
    a0.parent_id = Some("a".into());
    nodes.insert(a0);
    nodes.link("root", "a");
    nodes.link("root", "a");
    nodes.link("a", "a0");

    assert_eq!(nodes.get("root").unwrap().children, vec!["a"]);
    assert!(nodes.is_descendant_of("a0", "root"));
    assert!(!nodes.is_descendant_of("root", "a0"));
    assert_eq!(nodes.children("a")[0].id, "a0");
    assert_eq!(nodes.by_name("wf.a(0)").unwrap().id, "a0");
  }

  #[test]
  fn test_status_round_trip_is_exact() {
    let mut status = WorkflowStatus {
      phase: WorkflowPhase::Running,
      started_at: DateTime::from_timestamp(1_700_000_000, 123_456_789),
      message: Some("working".into()),
      ..Default::default()
    };
    let mut node = NodeStatus::new("n", "wf", "wf", NodeType::Pod);
    node.finish(
      NodePhase::Failed,
      Some("Error (exit code 1)".into()),
      DateTime::from_timestamp(1_700_000_005, 42).unwrap(),
    );
    status.nodes.insert(node);

    let json = serde_json::to_string(&status).unwrap();
    let back: WorkflowStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(back, status);
    assert_eq!(serde_json::to_string(&back).unwrap(), json);
  }
}
