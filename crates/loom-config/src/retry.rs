use serde::{Deserialize, Serialize};

use crate::template::IntOrString;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
  /// Maximum number of retries after the first attempt. Absent means retry
  /// without a count limit (other limits such as `maxDuration` still apply).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<IntOrString>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_policy: Option<RetryPolicy>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub backoff: Option<Backoff>,
}

impl RetryStrategy {
  pub fn policy(&self) -> RetryPolicy {
    self.retry_policy.unwrap_or_default()
  }
}

/// Which failure kinds a retry strategy reacts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
  Always,
  #[default]
  OnFailure,
  OnError,
  OnTransientError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
  /// Wait before the first retry, e.g. `"1s"`.
  #[serde(alias = "initial", skip_serializing_if = "Option::is_none")]
  pub duration: Option<String>,
  /// Multiplier applied per further retry.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub factor: Option<f64>,
  /// Upper bound on a single wait.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cap: Option<String>,
  /// Upper bound on the total time spent retrying, measured from the first
  /// attempt's start.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_duration: Option<String>,
}
