use serde::{Deserialize, Serialize};

use crate::scalar;

/// Declared inputs of a template, or (with values filled) the resolved inputs
/// of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inputs {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<Parameter>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<Artifact>,
}

/// Arguments passed by a caller (workflow spec, DAG task, step) share the
/// shape of template inputs.
pub type Arguments = Inputs;

impl Inputs {
  pub fn is_empty(&self) -> bool {
    self.parameters.is_empty() && self.artifacts.is_empty()
  }

  pub fn parameter(&self, name: &str) -> Option<&Parameter> {
    self.parameters.iter().find(|p| p.name == name)
  }

  pub fn artifact(&self, name: &str) -> Option<&Artifact> {
    self.artifacts.iter().find(|a| a.name == name)
  }
}

/// Declared outputs of a template, or the captured outputs of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<Parameter>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<Artifact>,
  /// Trimmed stdout of the main container, when captured.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
}

impl Outputs {
  pub fn is_empty(&self) -> bool {
    self.parameters.is_empty()
      && self.artifacts.is_empty()
      && self.result.is_none()
      && self.exit_code.is_none()
  }

  pub fn parameter(&self, name: &str) -> Option<&Parameter> {
    self.parameters.iter().find(|p| p.name == name)
  }

  pub fn artifact(&self, name: &str) -> Option<&Artifact> {
    self.artifacts.iter().find(|a| a.name == name)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
  pub name: String,
  #[serde(
    default,
    deserialize_with = "scalar::opt_string",
    skip_serializing_if = "Option::is_none"
  )]
  pub value: Option<String>,
  #[serde(
    default,
    deserialize_with = "scalar::opt_string",
    skip_serializing_if = "Option::is_none"
  )]
  pub default: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value_from: Option<ValueFrom>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl Parameter {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: Some(value.into()),
      ..Default::default()
    }
  }

  /// The supplied value, falling back to the declared default.
  pub fn effective_value(&self) -> Option<&str> {
    self.value.as_deref().or(self.default.as_deref())
  }
}

/// Where an output parameter's value comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
  /// File inside the main container, read after the command exits.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// JSON path into the object a resource template acted on.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub json_path: Option<String>,
  /// Expression over child outputs, for dag and steps templates.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parameter: Option<String>,
  /// Used when the source is missing, instead of failing.
  #[serde(
    default,
    deserialize_with = "scalar::opt_string",
    skip_serializing_if = "Option::is_none"
  )]
  pub default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
  pub name: String,
  /// Location inside the container: read from for outputs, unpacked to for
  /// inputs.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// Reference to another node's artifact, e.g.
  /// `{{tasks.produce.outputs.artifacts.data}}`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub from: Option<String>,
  /// Storage coordinates in the artifact sink once uploaded or resolved.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub key: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub optional: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scalar_values_become_text() {
    let param: Parameter = serde_yaml::from_str("name: count\nvalue: 3\ndefault: true").unwrap();
    assert_eq!(param.value.as_deref(), Some("3"));
    assert_eq!(param.default.as_deref(), Some("true"));
  }

  #[test]
  fn test_effective_value_prefers_supplied() {
    let mut param = Parameter::new("msg", "hi");
    param.default = Some("fallback".to_string());
    assert_eq!(param.effective_value(), Some("hi"));
    param.value = None;
    assert_eq!(param.effective_value(), Some("fallback"));
  }

  #[test]
  fn test_empty_outputs_are_not_serialized() {
    let outputs = Outputs::default();
    assert!(outputs.is_empty());
    assert_eq!(serde_json::to_string(&outputs).unwrap(), "{}");
  }
}
