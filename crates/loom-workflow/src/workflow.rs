use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use loom_config::{ObjectMeta, ShutdownStrategy, Template, TemplateRef, WorkflowSpec};

use crate::node::NodeType;
use crate::phase::NodePhase;
use crate::status::WorkflowStatus;

/// A submitted workflow: metadata, the user's spec and the controller-owned
/// status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowSpec,
  #[serde(default)]
  pub status: WorkflowStatus,
}

impl Workflow {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WorkflowSpec) -> Self {
    Self {
      metadata: ObjectMeta::new(namespace, name),
      spec,
      status: WorkflowStatus::default(),
    }
  }

  pub fn name(&self) -> &str {
    &self.metadata.name
  }

  pub fn namespace(&self) -> &str {
    &self.metadata.namespace
  }

  pub fn key(&self) -> String {
    self.metadata.key()
  }

  pub fn is_completed(&self) -> bool {
    self.status.phase.is_completed()
  }

  /// Look up a frozen template.
  pub fn stored_template(&self, scope: &TemplateScope, name: &str) -> Option<&Template> {
    self
      .status
      .stored_templates
      .get(&stored_template_key(scope, name))
  }
}

/// A namespaced library of templates other workflows can reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowSpec,
}

/// A cluster-wide library of templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterWorkflowTemplate {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowSpec,
}

/// Where a template came from. Names inside a template resolve against the
/// same scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TemplateScope {
  /// Defined inline in the workflow spec.
  #[default]
  Local,
  /// Defined in the named `WorkflowTemplate`.
  Namespaced(String),
  /// Defined in the named `ClusterWorkflowTemplate`.
  Cluster(String),
}

impl TemplateScope {
  pub fn is_local(&self) -> bool {
    matches!(self, TemplateScope::Local)
  }

  pub fn from_ref(template_ref: &TemplateRef) -> Self {
    if template_ref.cluster_scope {
      TemplateScope::Cluster(template_ref.name.clone())
    } else {
      TemplateScope::Namespaced(template_ref.name.clone())
    }
  }

  fn path(&self) -> String {
    match self {
      TemplateScope::Local => "local".to_string(),
      TemplateScope::Namespaced(name) => format!("namespaced/{name}"),
      TemplateScope::Cluster(name) => format!("cluster/{name}"),
    }
  }
}

impl std::fmt::Display for TemplateScope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.path())
  }
}

/// Key of a template in `status.stored_templates`.
pub fn stored_template_key(scope: &TemplateScope, name: &str) -> String {
  let digest = Sha256::digest(format!("{}/{}", scope.path(), name).as_bytes());
  hex::encode(&digest[..8])
}

/// Resume a suspended workflow: clear `spec.suspend` and complete every
/// running suspend node. Returns whether anything changed.
pub fn resume_workflow(workflow: &mut Workflow, now: DateTime<Utc>) -> bool {
  let mut changed = workflow.spec.suspend.take().unwrap_or(false);

  let suspended: Vec<String> = workflow
    .status
    .nodes
    .iter()
    .filter(|n| n.node_type == NodeType::Suspend && n.phase == NodePhase::Running)
    .map(|n| n.id.clone())
    .collect();
  for id in suspended {
    if let Some(node) = workflow.status.nodes.get_mut(&id) {
      changed |= node.finish(NodePhase::Succeeded, Some("resumed".to_string()), now);
    }
  }
  changed
}

/// Request shutdown. Returns false when the workflow already finished or a
/// shutdown was already requested.
pub fn stop_workflow(workflow: &mut Workflow, strategy: ShutdownStrategy) -> bool {
  if workflow.is_completed() || workflow.spec.shutdown.is_some() {
    return false;
  }
  workflow.spec.shutdown = Some(strategy);
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::NodeStatus;

  fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
  }

  #[test]
  fn test_stored_template_keys_are_scoped() {
    let local = stored_template_key(&TemplateScope::Local, "echo");
    let namespaced = stored_template_key(&TemplateScope::Namespaced("lib".into()), "echo");
    assert_ne!(local, namespaced);
    assert_eq!(local, stored_template_key(&TemplateScope::Local, "echo"));
    assert_eq!(local.len(), 16);
  }

  #[test]
  fn test_resume_completes_suspend_nodes() {
    let mut wf = Workflow::new("default", "wf", WorkflowSpec::default());
    wf.spec.suspend = Some(true);
    let mut node = NodeStatus::new("s", "wf.wait", "wait", NodeType::Suspend);
    node.transition(NodePhase::Running, ts(1));
    wf.status.nodes.insert(node);

    assert!(resume_workflow(&mut wf, ts(2)));
    assert_eq!(wf.spec.suspend, None);
    let node = wf.status.nodes.get("s").unwrap();
    assert_eq!(node.phase, NodePhase::Succeeded);
    assert_eq!(node.finished_at, Some(ts(2)));

    assert!(!resume_workflow(&mut wf, ts(3)));
  }

  #[test]
  fn test_stop_is_one_shot() {
    let mut wf = Workflow::new("default", "wf", WorkflowSpec::default());
    assert!(stop_workflow(&mut wf, ShutdownStrategy::Terminate));
    assert!(!stop_workflow(&mut wf, ShutdownStrategy::Stop));
    assert_eq!(wf.spec.shutdown, Some(ShutdownStrategy::Terminate));
  }
}
