use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use loom_artifact::FsStore;
use loom_config::duration::parse_duration;
use loom_workflow::contract::{DEFAULT_AGENT_ROOT, env};

use crate::error::{ExecutorError, Result};
use crate::paths::AgentPaths;

const DEFAULT_PROGRESS_TICK: Duration = Duration::from_secs(1);
const DEFAULT_SIGNAL_POLL: Duration = Duration::from_millis(500);
const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// Everything the agent learns from its pod environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
  pub root: PathBuf,
  pub pod_name: String,
  pub pod_uid: String,
  pub namespace: String,
  pub workflow: String,
  pub workflow_uid: String,
  pub node_id: String,
  /// Instant after which the command receives SIGTERM.
  pub deadline: Option<DateTime<Utc>>,
  pub progress_tick: Duration,
  pub signal_poll: Duration,
  /// Time between SIGTERM and SIGKILL when the deadline passes.
  pub termination_grace: Duration,
  /// Send trimmed stdout back as `outputs.result`.
  pub include_script_output: bool,
  /// Root of the filesystem artifact repository, when one is mounted.
  pub artifact_root: Option<PathBuf>,
  /// Raw template payload: JSON or the offload sentinel.
  pub template: Option<String>,
  pub template_mount: Option<PathBuf>,
}

impl AgentConfig {
  pub fn new(
    root: impl Into<PathBuf>,
    namespace: impl Into<String>,
    workflow: impl Into<String>,
    node_id: impl Into<String>,
  ) -> Self {
    let node_id = node_id.into();
    Self {
      root: root.into(),
      pod_name: node_id.clone(),
      pod_uid: String::new(),
      namespace: namespace.into(),
      workflow: workflow.into(),
      workflow_uid: String::new(),
      node_id,
      deadline: None,
      progress_tick: DEFAULT_PROGRESS_TICK,
      signal_poll: DEFAULT_SIGNAL_POLL,
      termination_grace: DEFAULT_TERMINATION_GRACE,
      include_script_output: false,
      artifact_root: None,
      template: None,
      template_mount: None,
    }
  }

  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Build from any variable source; `from_env` passes the process
  /// environment, local mode passes a container's declared env.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let require = |name: &'static str| lookup(name).ok_or(ExecutorError::MissingEnv(name));
    let duration = |name: &'static str, default: Duration| -> Result<Duration> {
      match lookup(name) {
        None => Ok(default),
        Some(text) => parse_duration(&text).map_err(|e| ExecutorError::InvalidEnv {
          name,
          message: e.to_string(),
        }),
      }
    };

    let mut config = Self::new(
      lookup(env::AGENT_ROOT).unwrap_or_else(|| DEFAULT_AGENT_ROOT.to_string()),
      require(env::WORKFLOW_NAMESPACE)?,
      require(env::WORKFLOW_NAME)?,
      require(env::NODE_ID)?,
    );
    if let Some(pod) = lookup(env::POD_NAME) {
      config.pod_name = pod;
    }
    config.pod_uid = lookup(env::POD_UID).unwrap_or_default();
    config.workflow_uid = lookup(env::WORKFLOW_UID).unwrap_or_default();
    config.deadline = match lookup(env::DEADLINE) {
      None => None,
      Some(text) => Some(
        DateTime::parse_from_rfc3339(&text)
          .map_err(|e| ExecutorError::InvalidEnv {
            name: env::DEADLINE,
            message: e.to_string(),
          })?
          .with_timezone(&Utc),
      ),
    };
    config.progress_tick = duration(env::PROGRESS_TICK, DEFAULT_PROGRESS_TICK)?;
    config.signal_poll = duration(env::SIGNAL_POLL, DEFAULT_SIGNAL_POLL)?;
    config.termination_grace = duration(env::TERMINATION_GRACE, DEFAULT_TERMINATION_GRACE)?;
    config.include_script_output = lookup(env::INCLUDE_SCRIPT_OUTPUT).is_some_and(|v| v == "true");
    config.artifact_root = lookup(env::ARTIFACT_ROOT).map(PathBuf::from);
    config.template = lookup(env::TEMPLATE);
    config.template_mount = lookup(env::TEMPLATE_MOUNT).map(PathBuf::from);
    Ok(config)
  }

  pub fn paths(&self) -> AgentPaths {
    AgentPaths::new(self.root.clone())
  }

  pub fn artifact_store(&self) -> Option<FsStore> {
    self.artifact_root.as_ref().map(FsStore::new)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name| vars.get(name).cloned()
  }

  #[test]
  fn test_from_lookup_reads_contract_vars() {
    let config = AgentConfig::from_lookup(lookup(&[
      (env::WORKFLOW_NAMESPACE, "default"),
      (env::WORKFLOW_NAME, "wf"),
      (env::NODE_ID, "wf-0123456789"),
      (env::POD_NAME, "wf-0123456789"),
      (env::DEADLINE, "2026-01-01T00:00:05Z"),
      (env::TERMINATION_GRACE, "2s"),
      (env::INCLUDE_SCRIPT_OUTPUT, "true"),
      (env::AGENT_ROOT, "/tmp/agent"),
    ]))
    .unwrap();

    assert_eq!(config.root, PathBuf::from("/tmp/agent"));
    assert_eq!(config.workflow, "wf");
    assert_eq!(config.termination_grace, Duration::from_secs(2));
    assert!(config.include_script_output);
    assert_eq!(
      config.deadline.unwrap().to_rfc3339(),
      "2026-01-01T00:00:05+00:00"
    );
    assert_eq!(config.progress_tick, DEFAULT_PROGRESS_TICK);
  }

  #[test]
  fn test_from_lookup_requires_node_id() {
    let err = AgentConfig::from_lookup(lookup(&[
      (env::WORKFLOW_NAMESPACE, "default"),
      (env::WORKFLOW_NAME, "wf"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ExecutorError::MissingEnv(name) if name == env::NODE_ID));
  }

  #[test]
  fn test_from_lookup_rejects_bad_deadline() {
    let err = AgentConfig::from_lookup(lookup(&[
      (env::WORKFLOW_NAMESPACE, "default"),
      (env::WORKFLOW_NAME, "wf"),
      (env::NODE_ID, "n"),
      (env::DEADLINE, "tomorrow"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidEnv { .. }));
  }
}
