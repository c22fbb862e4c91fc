use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::io::{Arguments, Inputs, Outputs};
use crate::retry::RetryStrategy;

/// A reusable unit of work. Exactly one of the kind fields (`container`,
/// `script`, `resource`, `dag`, `steps`, `suspend`) must be set; use
/// [`Template::kind`] to get the tagged view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
  pub name: String,
  #[serde(default, skip_serializing_if = "Inputs::is_empty")]
  pub inputs: Inputs,
  #[serde(default, skip_serializing_if = "Outputs::is_empty")]
  pub outputs: Outputs,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub container: Option<Container>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub script: Option<Script>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resource: Option<ResourceTemplate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dag: Option<DagTemplate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub steps: Option<Vec<ParallelSteps>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub suspend: Option<SuspendTemplate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_strategy: Option<RetryStrategy>,
  /// Per-template timeout for the pods this template materializes.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<u64>,
  /// Cap on running leaf nodes below a dag/steps node of this template.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parallelism: Option<usize>,
}

/// Borrowed, tagged view over a template's kind.
#[derive(Debug, Clone, Copy)]
pub enum TemplateKind<'a> {
  Container(&'a Container),
  Script(&'a Script),
  Resource(&'a ResourceTemplate),
  Dag(&'a DagTemplate),
  Steps(&'a [ParallelSteps]),
  Suspend(&'a SuspendTemplate),
}

impl TemplateKind<'_> {
  /// Leaves are materialized as pods; everything else expands into children.
  pub fn is_leaf(&self) -> bool {
    matches!(
      self,
      TemplateKind::Container(_) | TemplateKind::Script(_) | TemplateKind::Resource(_)
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      TemplateKind::Container(_) => "container",
      TemplateKind::Script(_) => "script",
      TemplateKind::Resource(_) => "resource",
      TemplateKind::Dag(_) => "dag",
      TemplateKind::Steps(_) => "steps",
      TemplateKind::Suspend(_) => "suspend",
    }
  }
}

impl Template {
  pub fn kind(&self) -> Result<TemplateKind<'_>, ConfigError> {
    let mut kinds = Vec::new();
    if let Some(c) = &self.container {
      kinds.push(TemplateKind::Container(c));
    }
    if let Some(s) = &self.script {
      kinds.push(TemplateKind::Script(s));
    }
    if let Some(r) = &self.resource {
      kinds.push(TemplateKind::Resource(r));
    }
    if let Some(d) = &self.dag {
      kinds.push(TemplateKind::Dag(d));
    }
    if let Some(s) = &self.steps {
      kinds.push(TemplateKind::Steps(s));
    }
    if let Some(s) = &self.suspend {
      kinds.push(TemplateKind::Suspend(s));
    }

    match kinds.as_slice() {
      [kind] => Ok(*kind),
      [] => Err(ConfigError::InvalidTemplate {
        name: self.name.clone(),
        reason: "unknown template kind: none of container, script, resource, dag, steps, suspend is set"
          .to_string(),
      }),
      many => Err(ConfigError::InvalidTemplate {
        name: self.name.clone(),
        reason: format!(
          "multiple template kinds set: {}",
          many.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
        ),
      }),
    }
  }

  pub fn is_leaf(&self) -> bool {
    self.kind().map(|k| k.is_leaf()).unwrap_or(false)
  }

  /// The outputs a node of this template is expected to produce.
  pub fn outputs_schema(&self) -> &Outputs {
    &self.outputs
  }

  /// The user container of a container or script template.
  pub fn main_container(&self) -> Option<&Container> {
    self
      .container
      .as_ref()
      .or(self.script.as_ref().map(|s| &s.container))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub name: String,
  #[serde(default)]
  pub image: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub command: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub env: Vec<EnvVar>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
  #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
  pub resources: ResourceRequirements,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub volume_mounts: Vec<VolumeMount>,
}

impl Container {
  pub fn env_var(&self, name: &str) -> Option<&str> {
    self
      .env
      .iter()
      .find(|e| e.name == name)
      .map(|e| e.value.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
  pub name: String,
  #[serde(default)]
  pub value: String,
  /// Filled from the owning object's fields once it is admitted.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value_from: Option<EnvVarSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
  pub field_ref: FieldRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
  /// e.g. `metadata.uid`
  pub field_path: String,
}

impl EnvVar {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
      value_from: None,
    }
  }

  /// A variable whose value is the object field at `path`.
  pub fn field(name: impl Into<String>, path: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: String::new(),
      value_from: Some(EnvVarSource {
        field_ref: FieldRef {
          field_path: path.into(),
        },
      }),
    }
  }

  pub fn field_path(&self) -> Option<&str> {
    self.value_from.as_ref().map(|v| v.field_ref.field_path.as_str())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub requests: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
  pub fn is_empty(&self) -> bool {
    self.requests.is_empty() && self.limits.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
  pub name: String,
  pub mount_path: String,
}

/// A container whose `source` is written to a file and passed as the last
/// argument to `command`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
  #[serde(flatten)]
  pub container: Container,
  pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
  pub action: ResourceAction,
  /// The object manifest, YAML or JSON.
  pub manifest: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
  #[default]
  Create,
  Apply,
  Delete,
  Get,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTemplate {
  pub tasks: Vec<DagTask>,
  /// Stop starting new tasks once a task has failed unrecoverably. Defaults
  /// to true.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fail_fast: Option<bool>,
}

impl DagTemplate {
  pub fn task(&self, name: &str) -> Option<&DagTask> {
    self.tasks.iter().find(|t| t.name == name)
  }

  pub fn fail_fast(&self) -> bool {
    self.fail_fast.unwrap_or(true)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub template: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub template_ref: Option<TemplateRef>,
  #[serde(default, skip_serializing_if = "Arguments::is_empty")]
  pub arguments: Arguments,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<String>,
  /// Boolean expression over upstream task results, e.g.
  /// `A && (B.Failed || B.Errored)`. Takes precedence over `dependencies`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub depends: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub when: Option<String>,
  #[serde(flatten)]
  pub iteration: Iteration,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub continue_on: Option<ContinueOn>,
}

/// One group of steps that run in parallel.
pub type ParallelSteps = Vec<WorkflowStep>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub template: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub template_ref: Option<TemplateRef>,
  #[serde(default, skip_serializing_if = "Arguments::is_empty")]
  pub arguments: Arguments,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub when: Option<String>,
  #[serde(flatten)]
  pub iteration: Iteration,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub continue_on: Option<ContinueOn>,
}

/// Fan-out over a set of items. At most one source may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub with_items: Option<Vec<Value>>,
  /// Expression resolving to a JSON array.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub with_param: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub with_sequence: Option<Sequence>,
}

impl Iteration {
  pub fn is_set(&self) -> bool {
    self.with_items.is_some() || self.with_param.is_some() || self.with_sequence.is_some()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub count: Option<IntOrString>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start: Option<IntOrString>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end: Option<IntOrString>,
  /// printf-style format with a single `%d`, e.g. `"item-%d"`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub format: Option<String>,
}

/// Tolerated failure kinds for a task or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueOn {
  #[serde(default)]
  pub failed: bool,
  #[serde(default)]
  pub error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
  /// Name of the `WorkflowTemplate` (or `ClusterWorkflowTemplate`).
  pub name: String,
  /// Template within it.
  pub template: String,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub cluster_scope: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspendTemplate {
  /// `"30s"`, `"5m"` or bare seconds. Absent means wait for a resume.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration: Option<String>,
}

/// An integer that may also be written as a string (possibly an expression
/// that resolves to an integer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
  Int(i64),
  String(String),
}

impl IntOrString {
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      IntOrString::Int(v) => Some(*v),
      IntOrString::String(s) => s.trim().parse().ok(),
    }
  }
}

impl From<i64> for IntOrString {
  fn from(v: i64) -> Self {
    IntOrString::Int(v)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DIAMOND: &str = r#"
name: diamond
dag:
  tasks:
    - name: A
      template: echo
    - name: B
      template: echo
      dependencies: [A]
      arguments:
        parameters:
          - name: message
            value: "{{tasks.A.outputs.result}}"
    - name: C
      template: echo
      depends: "A.Succeeded"
      withItems: [1, 2, 3]
"#;

  #[test]
  fn test_dag_template_parses() {
    let template: Template = serde_yaml::from_str(DIAMOND).unwrap();
    let kind = template.kind().unwrap();
    assert!(matches!(kind, TemplateKind::Dag(_)));
    assert!(!kind.is_leaf());

    let dag = template.dag.as_ref().unwrap();
    assert!(dag.fail_fast());
    assert_eq!(dag.task("B").unwrap().dependencies, vec!["A"]);
    assert_eq!(dag.task("C").unwrap().depends.as_deref(), Some("A.Succeeded"));
    assert_eq!(
      dag.task("C").unwrap().iteration.with_items.as_ref().unwrap().len(),
      3
    );
  }

  #[test]
  fn test_script_flattens_container_fields() {
    let template: Template = serde_yaml::from_str(
      "name: s\nscript:\n  image: python\n  command: [python]\n  source: print(1)\n",
    )
    .unwrap();
    let container = template.main_container().unwrap();
    assert_eq!(container.image, "python");
    assert_eq!(container.command, vec!["python"]);
    assert!(template.is_leaf());
  }

  #[test]
  fn test_missing_kind_is_rejected() {
    let template = Template {
      name: "empty".to_string(),
      ..Default::default()
    };
    let err = template.kind().unwrap_err();
    assert!(err.to_string().contains("unknown template kind"));
  }

  #[test]
  fn test_multiple_kinds_are_rejected() {
    let template = Template {
      name: "both".to_string(),
      container: Some(Container::default()),
      suspend: Some(SuspendTemplate::default()),
      ..Default::default()
    };
    let err = template.kind().unwrap_err();
    assert!(err.to_string().contains("container, suspend"));
  }

  #[test]
  fn test_steps_are_nested_groups() {
    let template: Template = serde_yaml::from_str(
      "name: s\nsteps:\n- - name: a\n    template: t\n  - name: b\n    template: t\n- - name: c\n    template: t\n",
    )
    .unwrap();
    let steps = template.steps.as_ref().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].len(), 2);
    assert_eq!(steps[1][0].name, "c");
  }

  #[test]
  fn test_int_or_string() {
    assert_eq!(IntOrString::Int(3).as_i64(), Some(3));
    assert_eq!(IntOrString::String(" 4 ".to_string()).as_i64(), Some(4));
    assert_eq!(IntOrString::String("x".to_string()).as_i64(), None);
  }
}
