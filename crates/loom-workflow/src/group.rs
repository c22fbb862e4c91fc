use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_config::ObjectMeta;

/// A parent that owns a set of workflows (those labelled with
/// [`crate::contract::LABEL_GROUP`]) and is retired once it has been idle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGroup {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowGroupSpec,
  #[serde(default)]
  pub status: WorkflowGroupStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGroupSpec {
  /// Seconds without any non-terminal child before the group terminates.
  pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGroupStatus {
  #[serde(default)]
  pub phase: GroupPhase,
  /// Last time a non-terminal child was observed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_active_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPhase {
  #[default]
  Active,
  Terminating,
}
