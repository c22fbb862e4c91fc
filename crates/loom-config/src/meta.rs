use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata carried by every cluster object.
///
/// `resource_version` is the optimistic-concurrency marker: the store bumps
/// it on every write and rejects replacements that carry a stale value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub namespace: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub uid: String,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub resource_version: u64,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub creation_timestamp: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deletion_timestamp: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deletion_grace_period_seconds: Option<u64>,
}

fn is_zero(v: &u64) -> bool {
  *v == 0
}

impl ObjectMeta {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.labels.insert(key.into(), value.into());
    self
  }

  pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.annotations.insert(key.into(), value.into());
    self
  }

  pub fn label(&self, key: &str) -> Option<&str> {
    self.labels.get(key).map(String::as_str)
  }

  pub fn annotation(&self, key: &str) -> Option<&str> {
    self.annotations.get(key).map(String::as_str)
  }

  /// `namespace/name`, the identity used for work keys and log fields.
  pub fn key(&self) -> String {
    format!("{}/{}", self.namespace, self.name)
  }

  pub fn is_deleting(&self) -> bool {
    self.deletion_timestamp.is_some()
  }
}
