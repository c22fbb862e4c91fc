//! Controller configuration.
//!
//! Loaded from YAML (JSON parses too); every field has a default so an
//! empty document is a valid configuration. Durations are humane strings (`"10s"`,
//! `"1m30s"`) or plain seconds.

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use governor::Quota;
use serde::{Deserialize, Serialize};

use loom_config::duration::{humane, humane_opt};
use loom_operator::Limits;
use loom_workflow::contract::DEFAULT_AGENT_ROOT;

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
  /// Watch a single namespace; all namespaces when absent.
  pub namespace: Option<String>,
  /// Only manage workflows labelled with this controller instance id.
  pub instance_id: Option<String>,
  pub workers: usize,
  #[serde(with = "humane")]
  pub reconcile_timeout: Duration,
  /// Parallelism for workflows that set none.
  pub parallelism: Option<usize>,
  /// Cap on running leaves across all workflows of a namespace.
  pub namespace_parallelism: Option<usize>,
  pub resource_rate_limit: RateLimit,
  #[serde(with = "humane")]
  pub pod_termination_grace: Duration,
  /// Grace period passed to pod garbage-collection deletes.
  #[serde(with = "humane")]
  pub pod_gc_grace: Duration,
  /// How long a pod's GC gate must have been open before it is deleted.
  #[serde(with = "humane")]
  pub pod_gc_delete_delay: Duration,
  /// How long a requested pod may be missing before its node errors.
  #[serde(with = "humane")]
  pub pod_missing_grace: Duration,
  /// How long a finished pod may wait for its task result.
  #[serde(with = "humane")]
  pub task_result_grace: Duration,
  #[serde(with = "humane")]
  pub gc_interval: Duration,
  pub gc_workers: usize,
  pub retention_policy: Option<RetentionPolicy>,
  pub requeue: Requeue,
  pub executor: ExecutorSettings,
  pub archive: Option<ArchiveSettings>,
  pub node_events: bool,
  pub workflow_events: bool,
}

impl Default for ControllerConfig {
  fn default() -> Self {
    Self {
      namespace: None,
      instance_id: None,
      workers: 8,
      reconcile_timeout: Duration::from_secs(10),
      parallelism: None,
      namespace_parallelism: None,
      resource_rate_limit: RateLimit::default(),
      pod_termination_grace: Duration::from_secs(10),
      pod_gc_grace: Duration::from_secs(30),
      pod_gc_delete_delay: Duration::ZERO,
      pod_missing_grace: Duration::from_secs(10),
      task_result_grace: Duration::from_secs(60),
      gc_interval: Duration::from_secs(5),
      gc_workers: 4,
      retention_policy: None,
      requeue: Requeue::default(),
      executor: ExecutorSettings::default(),
      archive: None,
      node_events: true,
      workflow_events: true,
    }
  }
}

/// Token bucket over pod creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimit {
  /// Sustained creates per second.
  pub limit: u32,
  /// Creates allowed back to back once the bucket is full; `limit` when unset.
  pub burst: Option<u32>,
}

impl Default for RateLimit {
  fn default() -> Self {
    Self {
      limit: 100,
      burst: None,
    }
  }
}

impl RateLimit {
  pub fn quota(&self) -> Quota {
    let limit = NonZeroU32::new(self.limit).unwrap_or(NonZeroU32::MIN);
    let burst = self.burst.and_then(NonZeroU32::new).unwrap_or(limit);
    Quota::per_second(limit).allow_burst(burst)
  }
}

/// Most workflows kept per namespace and phase; oldest go first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionPolicy {
  pub completed: Option<usize>,
  pub failed: Option<usize>,
  pub errored: Option<usize>,
}

/// Backoff for keys whose reconcile failed transiently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Requeue {
  #[serde(with = "humane")]
  pub base: Duration,
  #[serde(with = "humane")]
  pub cap: Duration,
}

impl Default for Requeue {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(100),
      cap: Duration::from_secs(30),
    }
  }
}

/// How task pods reach the executor agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
  pub image: String,
  pub agent_root: String,
  #[serde(with = "humane")]
  pub progress_tick: Duration,
  #[serde(with = "humane")]
  pub signal_poll: Duration,
  /// Filesystem artifact repository handed to every pod.
  pub artifact_root: Option<String>,
}

impl Default for ExecutorSettings {
  fn default() -> Self {
    Self {
      image: "loom:latest".to_string(),
      agent_root: DEFAULT_AGENT_ROOT.to_string(),
      progress_tick: Duration::from_secs(1),
      signal_poll: Duration::from_millis(500),
      artifact_root: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSettings {
  pub database_url: String,
  /// Archived rows older than this are removed.
  #[serde(default, with = "humane_opt", skip_serializing_if = "Option::is_none")]
  pub ttl: Option<Duration>,
}

impl ControllerConfig {
  pub fn parse(text: &str) -> Result<Self> {
    if text.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(text).map_err(|e| ControllerError::Config(e.to_string()))
  }

  pub fn load(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| ControllerError::Config(format!("read {}: {e}", path.display())))?;
    Self::parse(&text)
  }

  pub fn validate(&self) -> Result<()> {
    let invalid = |message: &str| Err(ControllerError::Config(message.to_string()));
    if self.workers == 0 {
      return invalid("workers must be at least 1");
    }
    if self.gc_workers == 0 {
      return invalid("gc_workers must be at least 1");
    }
    if self.reconcile_timeout.is_zero() {
      return invalid("reconcile_timeout must be positive");
    }
    if self.gc_interval.is_zero() {
      return invalid("gc_interval must be positive");
    }
    if self.resource_rate_limit.limit == 0 || self.resource_rate_limit.burst == Some(0) {
      return invalid("resource_rate_limit limit and burst must be at least 1");
    }
    if self.parallelism == Some(0) || self.namespace_parallelism == Some(0) {
      return invalid("parallelism caps must be at least 1");
    }
    if self.requeue.base.is_zero() || self.requeue.base > self.requeue.cap {
      return invalid("requeue.base must be positive and no larger than requeue.cap");
    }
    if self.executor.image.is_empty() {
      return invalid("executor.image must be set");
    }
    if !self.executor.agent_root.starts_with('/') {
      return invalid("executor.agent_root must be an absolute path");
    }
    if let Some(archive) = &self.archive
      && archive.database_url.is_empty()
    {
      return invalid("archive.database_url must be set");
    }
    Ok(())
  }

  /// Operator limits for one reconcile of a workflow in a namespace that has
  /// `namespace_active` running leaves elsewhere.
  pub fn limits(&self, namespace_active: usize) -> Limits {
    Limits {
      default_parallelism: self.parallelism,
      namespace_parallelism: self.namespace_parallelism,
      namespace_active,
      pod_missing_grace: self.pod_missing_grace,
      result_grace: self.task_result_grace,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_is_default() {
    let config = ControllerConfig::parse("").unwrap();
    assert_eq!(config, ControllerConfig::default());
    config.validate().unwrap();
  }

  #[test]
  fn test_parse_yaml_with_humane_durations() {
    let config = ControllerConfig::parse(
      r#"
namespace: batch
workers: 2
reconcile_timeout: 1m30s
pod_termination_grace: 3
resource_rate_limit:
  limit: 5
retention_policy:
  failed: 10
requeue:
  base: 50ms
  cap: 5s
executor:
  image: loom:dev
archive:
  database_url: "sqlite::memory:"
  ttl: 7d
"#,
    )
    .unwrap();

    assert_eq!(config.namespace.as_deref(), Some("batch"));
    assert_eq!(config.workers, 2);
    assert_eq!(config.reconcile_timeout, Duration::from_secs(90));
    assert_eq!(config.pod_termination_grace, Duration::from_secs(3));
    let five = NonZeroU32::new(5).unwrap();
    assert_eq!(config.resource_rate_limit.quota(), Quota::per_second(five));
    assert_eq!(config.retention_policy.unwrap().failed, Some(10));
    assert_eq!(config.requeue.base, Duration::from_millis(50));
    assert_eq!(config.executor.image, "loom:dev");
    assert_eq!(config.executor.agent_root, DEFAULT_AGENT_ROOT);
    assert_eq!(
      config.archive.unwrap().ttl,
      Some(Duration::from_secs(7 * 86400))
    );
  }

  #[test]
  fn test_unknown_field_is_rejected() {
    let err = ControllerConfig::parse("wrokers: 3\n").unwrap_err();
    assert!(matches!(err, ControllerError::Config(_)));
  }

  #[test]
  fn test_validate_rejects_bad_values() {
    let cases: Vec<(&str, Box<dyn Fn(&mut ControllerConfig)>)> = vec![
      ("workers", Box::new(|c| c.workers = 0)),
      ("parallelism", Box::new(|c| c.parallelism = Some(0))),
      (
        "requeue",
        Box::new(|c| c.requeue.base = Duration::from_secs(60)),
      ),
      (
        "agent_root",
        Box::new(|c| c.executor.agent_root = "relative".into()),
      ),
    ];
    for (name, mutate) in cases {
      let mut config = ControllerConfig::default();
      mutate(&mut config);
      let err = config.validate().unwrap_err().to_string();
      assert!(err.contains(name), "{name}: {err}");
    }
  }
}
