use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_config::{Container, EnvVar, ObjectMeta};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: PodSpec,
  #[serde(default)]
  pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub init_containers: Vec<Container>,
  #[serde(default)]
  pub containers: Vec<Container>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub volumes: Vec<Volume>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub restart_policy: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub termination_grace_period_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
  pub name: String,
  /// Scratch directory shared by the pod's containers.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub empty_dir: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub config_map: Option<ConfigMapVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapVolume {
  pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Unknown,
}

impl PodPhase {
  pub fn is_terminal(self) -> bool {
    matches!(self, PodPhase::Succeeded | PodPhase::Failed)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
  #[serde(default)]
  pub phase: PodPhase,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub init_container_statuses: Vec<ContainerStatus>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
  pub name: String,
  pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ContainerState {
  Waiting {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },
  Running {
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
  },
  Terminated {
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
  },
}

impl Pod {
  pub fn container_status(&self, name: &str) -> Option<&ContainerStatus> {
    self
      .status
      .container_statuses
      .iter()
      .find(|c| c.name == name)
  }

  /// Exit code of a terminated container.
  pub fn exit_code(&self, container: &str) -> Option<i32> {
    match self.container_status(container).map(|c| &c.state) {
      Some(ContainerState::Terminated { exit_code, .. }) => Some(*exit_code),
      _ => None,
    }
  }

  /// When a terminated container finished.
  pub fn finished_at(&self, container: &str) -> Option<DateTime<Utc>> {
    match self.container_status(container).map(|c| &c.state) {
      Some(ContainerState::Terminated { finished_at, .. }) => *finished_at,
      _ => None,
    }
  }

  /// Set (or replace) a container's state.
  pub fn set_container_state(&mut self, name: &str, state: ContainerState) {
    match self
      .status
      .container_statuses
      .iter_mut()
      .find(|c| c.name == name)
    {
      Some(status) => status.state = state,
      None => self.status.container_statuses.push(ContainerStatus {
        name: name.to_string(),
        state,
      }),
    }
  }

  pub fn container(&self, name: &str) -> Option<&Container> {
    self.spec.containers.iter().find(|c| c.name == name)
  }

  /// A variable's value as the pod's containers see it.
  pub fn env_value(&self, var: &EnvVar) -> String {
    match var.field_path() {
      Some(path) => meta_field(&self.metadata, path).unwrap_or_default(),
      None => var.value.clone(),
    }
  }

  /// Fill field-ref variables from the pod's metadata.
  pub fn resolve_field_refs(&mut self) {
    let meta = &self.metadata;
    let containers = self
      .spec
      .init_containers
      .iter_mut()
      .chain(self.spec.containers.iter_mut());
    for var in containers.flat_map(|c| c.env.iter_mut()) {
      if let Some(value) = var.field_path().and_then(|path| meta_field(meta, path)) {
        var.value = value;
      }
    }
  }
}

fn meta_field(meta: &ObjectMeta, path: &str) -> Option<String> {
  match path {
    "metadata.name" => Some(meta.name.clone()),
    "metadata.namespace" => Some(meta.namespace.clone()),
    "metadata.uid" => Some(meta.uid.clone()),
    _ => path
      .strip_prefix("metadata.labels.")
      .and_then(|key| meta.label(key))
      .map(str::to_string),
  }
}
