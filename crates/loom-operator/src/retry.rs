use std::time::Duration;

use chrono::{DateTime, Utc};

use loom_config::duration::parse_duration;
use loom_config::{Backoff, IntOrString, RetryPolicy, RetryStrategy};
use loom_workflow::{NodePhase, NodeStatus};

#[derive(Debug, PartialEq)]
pub enum Decision {
  /// Start the next attempt now.
  Retry,
  /// Start the next attempt at the given instant.
  Wait(DateTime<Utc>),
  /// No more attempts; the retry node takes the last attempt's result.
  GiveUp(Option<String>),
}

const TRANSIENT_PATTERNS: &[&str] = &[
  "pod deleted",
  "executor agent fault",
  "connection refused",
  "connection reset",
  "timed out",
  "timeout",
  "too many requests",
  "service unavailable",
  "transient",
];

pub fn is_transient(message: Option<&str>) -> bool {
  let Some(message) = message else {
    return false;
  };
  let lower = message.to_ascii_lowercase();
  TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Maximum retries after the first attempt; `Ok(None)` means unbounded.
/// A string limit that is not an integer comes back as `Err` with the text.
pub fn limit(strategy: &RetryStrategy) -> Result<Option<i64>, String> {
  match &strategy.limit {
    None => Ok(None),
    Some(IntOrString::Int(n)) => Ok(Some(*n)),
    Some(IntOrString::String(s)) => s.trim().parse().map(Some).map_err(|_| s.clone()),
  }
}

/// Wait before retry number `retry` (1-based): `duration * factor^(retry-1)`,
/// bounded by `cap`.
pub fn backoff_wait(backoff: &Backoff, retry: usize) -> Option<Duration> {
  let base = parse_duration(backoff.duration.as_deref()?).ok()?;
  let factor = backoff.factor.unwrap_or(1.0).max(0.0);
  let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
  let secs = base.as_secs_f64() * factor.powi(exponent);
  let mut wait = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
  if let Some(cap) = backoff.cap.as_deref().and_then(|c| parse_duration(c).ok()) {
    wait = wait.min(cap);
  }
  Some(wait)
}

/// What to do after an attempt failed.
///
/// `attempts` counts the attempts made so far including `last`. `stopping`
/// is set while the workflow is shutting down or past its deadline.
pub fn decide(
  strategy: &RetryStrategy,
  retry_node: &NodeStatus,
  last: &NodeStatus,
  attempts: usize,
  stopping: bool,
  now: DateTime<Utc>,
) -> Decision {
  if stopping {
    return Decision::GiveUp(last.message.clone());
  }

  let policy_allows = match strategy.policy() {
    RetryPolicy::Always => true,
    RetryPolicy::OnFailure => last.phase == NodePhase::Failed,
    RetryPolicy::OnError => last.phase == NodePhase::Error,
    RetryPolicy::OnTransientError => {
      last.phase == NodePhase::Error && is_transient(last.message.as_deref())
    }
  };
  if !policy_allows {
    return Decision::GiveUp(last.message.clone());
  }

  let retries_used = attempts.saturating_sub(1) as i64;
  if let Ok(Some(l)) = limit(strategy)
    && retries_used >= l
  {
    return Decision::GiveUp(last.message.clone());
  }

  let backoff = strategy.backoff.as_ref();
  if let (Some(max), Some(started)) = (
    backoff
      .and_then(|b| b.max_duration.as_deref())
      .and_then(|d| parse_duration(d).ok()),
    retry_node.started_at,
  ) && now.signed_duration_since(started).to_std().unwrap_or_default() >= max
  {
    return Decision::GiveUp(Some("Max duration limit exceeded".to_string()));
  }

  let wait = backoff.and_then(|b| backoff_wait(b, attempts));
  match (wait, last.finished_at) {
    (Some(wait), Some(finished)) => {
      let due = chrono::Duration::from_std(wait)
        .ok()
        .and_then(|w| finished.checked_add_signed(w))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
      if now < due {
        Decision::Wait(due)
      } else {
        Decision::Retry
      }
    }
    _ => Decision::Retry,
  }
}
