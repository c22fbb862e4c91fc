use std::path::{Path, PathBuf};

use loom_workflow::contract::files;

/// Layout of the shared agent volume.
#[derive(Debug, Clone)]
pub struct AgentPaths {
  root: PathBuf,
}

impl AgentPaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn template(&self) -> PathBuf {
    self.root.join(files::TEMPLATE)
  }

  pub fn signal(&self) -> PathBuf {
    self.root.join(files::SIGNAL)
  }

  pub fn stdout(&self) -> PathBuf {
    self.root.join(files::STDOUT)
  }

  pub fn stderr(&self) -> PathBuf {
    self.root.join(files::STDERR)
  }

  pub fn exitcode(&self) -> PathBuf {
    self.root.join(files::EXITCODE)
  }

  pub fn fault(&self) -> PathBuf {
    self.root.join(files::FAULT)
  }

  pub fn script(&self) -> PathBuf {
    self.root.join(files::SCRIPT)
  }

  pub fn binary(&self) -> PathBuf {
    self.root.join(files::AGENT_BINARY)
  }

  pub fn result(&self) -> PathBuf {
    self.root.join(files::RESULT)
  }

  pub fn parameters(&self) -> PathBuf {
    self.root.join(files::OUTPUT_PARAMETERS)
  }

  pub fn parameter(&self, name: &str) -> PathBuf {
    self.parameters().join(name)
  }

  pub fn artifacts(&self) -> PathBuf {
    self.root.join(files::OUTPUT_ARTIFACTS)
  }

  pub fn artifact(&self, name: &str) -> PathBuf {
    self.artifacts().join(format!("{name}.tgz"))
  }
}
