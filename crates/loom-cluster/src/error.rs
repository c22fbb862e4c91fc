use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClusterError {
  #[error("{kind} {key} not found")]
  NotFound { kind: &'static str, key: String },

  #[error("{kind} {key} already exists")]
  AlreadyExists { kind: &'static str, key: String },

  #[error("{kind} {key} was modified concurrently (have {expected}, store has {actual})")]
  Conflict {
    kind: &'static str,
    key: String,
    expected: u64,
    actual: u64,
  },

  #[error("watch marker {0} is no longer retained")]
  Gone(u64),

  #[error("invalid object: {0}")]
  Invalid(String),

  #[error("cluster unavailable: {0}")]
  Unavailable(String),
}

impl ClusterError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, ClusterError::NotFound { .. })
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, ClusterError::Conflict { .. })
  }

  pub fn is_already_exists(&self) -> bool {
    matches!(self, ClusterError::AlreadyExists { .. })
  }

  /// Worth retrying after a backoff.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      ClusterError::Conflict { .. } | ClusterError::Gone(_) | ClusterError::Unavailable(_)
    )
  }
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
