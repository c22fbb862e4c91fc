use loom_archive::ArchiveError;
use loom_cluster::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("cluster: {0}")]
  Cluster(#[from] ClusterError),

  #[error("archive: {0}")]
  Archive(#[from] ArchiveError),

  #[error("reconcile of {key} exceeded {timeout:?}")]
  Timeout {
    key: String,
    timeout: std::time::Duration,
  },
}

impl ControllerError {
  /// Failures the worker retries with backoff instead of logging and
  /// dropping.
  pub fn is_transient(&self) -> bool {
    match self {
      ControllerError::Cluster(err) => err.is_transient(),
      ControllerError::Timeout { .. } => true,
      ControllerError::Archive(_) => true,
      ControllerError::Config(_) => false,
    }
  }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
