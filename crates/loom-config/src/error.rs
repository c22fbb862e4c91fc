use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid YAML manifest: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("invalid JSON manifest: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid duration '{0}'")]
  InvalidDuration(String),

  #[error("invalid resource quantity '{0}'")]
  InvalidQuantity(String),

  #[error("template '{name}': {reason}")]
  InvalidTemplate { name: String, reason: String },
}
