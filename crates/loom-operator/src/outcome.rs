use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use loom_cluster::{Pod, TaskResult};
use loom_config::{Template, WorkflowSpec};
use loom_workflow::{NodePhase, TemplateScope, Workflow, WorkflowPhase, WorkflowStatus};

/// Everything one operator pass looks at. Pods and results are the ones
/// labelled with this workflow.
pub struct Snapshot<'a> {
  pub workflow: &'a Workflow,
  pub pods: &'a [Pod],
  pub results: &'a [TaskResult],
  /// Specs of the workflow templates referenced by the workflow, only
  /// consulted while the workflow is being initialised.
  pub libraries: &'a BTreeMap<TemplateScope, WorkflowSpec>,
  pub now: DateTime<Utc>,
  pub limits: &'a Limits,
}

#[derive(Debug, Clone)]
pub struct Limits {
  /// Cap for workflows that set no `spec.parallelism`.
  pub default_parallelism: Option<usize>,
  pub namespace_parallelism: Option<usize>,
  /// Live leaves of other workflows in the same namespace.
  pub namespace_active: usize,
  /// How long a requested pod may be absent from the cache before the node
  /// errors with "pod deleted".
  pub pod_missing_grace: Duration,
  /// How long a finished pod may wait for its task result.
  pub result_grace: Duration,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      default_parallelism: None,
      namespace_parallelism: None,
      namespace_active: 0,
      pod_missing_grace: Duration::from_secs(10),
      result_grace: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillCause {
  Deadline,
  Cancelled,
}

impl KillCause {
  pub fn as_str(self) -> &'static str {
    match self {
      KillCause::Deadline => "deadline",
      KillCause::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for KillCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A node that should have a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRequest {
  pub node_id: String,
  pub node_name: String,
  pub pod_name: String,
  /// The leaf template with inputs bound and every expression substituted.
  pub template: Template,
  pub deadline: Option<DateTime<Utc>>,
  pub include_script_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
  CreatePod(PodRequest),
  KillPod {
    node_id: String,
    pod_name: String,
    cause: KillCause,
  },
  /// Relabel the pod of a finished node `completed=true`.
  MarkCompleted { pod_name: String },
}

/// A human-visible status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
  Workflow {
    phase: WorkflowPhase,
    message: Option<String>,
  },
  Node {
    id: String,
    name: String,
    phase: NodePhase,
    message: Option<String>,
  },
}

#[derive(Debug, Clone)]
pub struct Outcome {
  pub status: WorkflowStatus,
  pub actions: Vec<Action>,
  /// When the workflow must be looked at again even if nothing changes.
  pub requeue_after: Option<Duration>,
  pub transitions: Vec<Transition>,
}
