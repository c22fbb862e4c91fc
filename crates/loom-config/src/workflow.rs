use serde::{Deserialize, Serialize};

use crate::io::Arguments;
use crate::retry::RetryStrategy;
use crate::template::Template;

/// The user-authored part of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub templates: Vec<Template>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub entrypoint: String,
  #[serde(default, skip_serializing_if = "Arguments::is_empty")]
  pub arguments: Arguments,
  /// Cap on concurrently running leaf nodes of this workflow.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parallelism: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ttl_strategy: Option<TtlStrategy>,
  #[serde(rename = "podGC", skip_serializing_if = "Option::is_none")]
  pub pod_gc: Option<PodGc>,
  /// Set by a user to cancel the workflow.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub shutdown: Option<ShutdownStrategy>,
  /// While true no new pods are created.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub suspend: Option<bool>,
  /// Default retry strategy for leaf templates that declare none.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_strategy: Option<RetryStrategy>,
  /// Adopt the template library (and, when unset here, the entrypoint and
  /// arguments) of a stored workflow template.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub workflow_template_ref: Option<WorkflowTemplateRef>,
}

impl WorkflowSpec {
  pub fn template(&self, name: &str) -> Option<&Template> {
    self.templates.iter().find(|t| t.name == name)
  }

  pub fn is_suspended(&self) -> bool {
    self.suspend.unwrap_or(false)
  }
}

/// How long a finished workflow is kept before deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub seconds_after_completion: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub seconds_after_success: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub seconds_after_failure: Option<u64>,
}

impl TtlStrategy {
  /// The TTL applying to a workflow that finished successfully or not. The
  /// outcome-specific value wins over `seconds_after_completion`.
  pub fn seconds_for(&self, succeeded: bool) -> Option<u64> {
    let specific = if succeeded {
      self.seconds_after_success
    } else {
      self.seconds_after_failure
    };
    specific.or(self.seconds_after_completion)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGc {
  #[serde(default)]
  pub strategy: PodGcStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodGcStrategy {
  /// Keep pods until the workflow object itself is deleted.
  #[default]
  Never,
  OnPodCompletion,
  OnPodSuccess,
  OnWorkflowCompletion,
  OnWorkflowSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
  Terminate,
  Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplateRef {
  pub name: String,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub cluster_scope: bool,
}
