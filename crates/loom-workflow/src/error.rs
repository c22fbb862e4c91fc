use thiserror::Error;

use loom_config::ConfigError;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("spec.entrypoint is required")]
  MissingEntrypoint,

  #[error("template '{name}' not found (referenced by {referenced_by})")]
  TemplateNotFound { name: String, referenced_by: String },

  #[error("template '{0}' is defined more than once")]
  DuplicateTemplate(String),

  #[error("template '{template}': task or step name '{name}' is {reason}")]
  InvalidName {
    template: String,
    name: String,
    reason: String,
  },

  #[error("template '{template}': task '{task}' depends on unknown task '{dependency}'")]
  UnknownDependency {
    template: String,
    task: String,
    dependency: String,
  },

  #[error("template '{template}': dependency cycle through task '{task}'")]
  Cycle { template: String, task: String },

  #[error("invalid depends expression '{expression}': {reason}")]
  InvalidDepends { expression: String, reason: String },

  #[error("template '{template}': {reason}")]
  InvalidField { template: String, reason: String },

  #[error("malformed expression '{expression}': {reason}")]
  InvalidExpression { expression: String, reason: String },
}
