//! Executor agent errors.

use loom_cluster::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  #[error("environment variable {0} is not set")]
  MissingEnv(&'static str),

  #[error("invalid {name}: {message}")]
  InvalidEnv { name: &'static str, message: String },

  #[error("invalid template payload: {message}")]
  Template { message: String },

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: std::io::Error,
  },

  #[error("template has no command to run")]
  NoCommand,

  #[error("failed to start `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// A declared output the command did not produce.
  #[error("{kind} '{name}' not found at {path}")]
  MissingOutput {
    kind: &'static str,
    name: String,
    path: String,
  },

  #[error("input artifact '{name}' has no repository key")]
  UnboundArtifact { name: String },

  #[error("no artifact repository configured")]
  NoRepository,

  #[error("artifact repository: {0}")]
  Artifact(#[from] loom_artifact::Error),

  #[error("cluster: {0}")]
  Cluster(#[from] ClusterError),

  #[error("signal delivery failed: {0}")]
  Signal(#[from] nix::errno::Errno),

  #[error("file watch failed: {0}")]
  Watch(#[from] notify::Error),

  #[error("resource {action}: {message}")]
  Resource { action: &'static str, message: String },

  #[error("cancelled")]
  Cancelled,
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Attach a description of the failed operation to an io error.
pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ExecutorError {
  let context = context.into();
  move |source| ExecutorError::Io { context, source }
}
