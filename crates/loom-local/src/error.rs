use thiserror::Error;

use loom_cluster::ClusterError;
use loom_executor::ExecutorError;

#[derive(Debug, Error)]
pub enum LocalError {
  #[error(transparent)]
  Cluster(#[from] ClusterError),

  #[error(transparent)]
  Executor(#[from] ExecutorError),

  #[error("pod {0} has no {1} container")]
  MissingContainer(String, &'static str),

  #[error("config map {0} has no offloaded template")]
  MissingTemplate(String),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: std::io::Error,
  },
}

pub type Result<T, E = LocalError> = std::result::Result<T, E>;
