//! Loom Config
//!
//! Serializable manifest types for loom. These are the shapes a user submits
//! (a workflow spec with its template library) and the object metadata every
//! cluster resource carries. Field names follow the camelCase manifest
//! convention so existing workflow manifests parse unchanged.
//!
//! Manifests can be loaded from:
//! - YAML documents (the usual submission format)
//! - JSON documents (the persisted form and the executor's template payload)
//!
//! Nothing here resolves references or evaluates expressions; the operator
//! takes these types and expands them into a node tree.

pub mod duration;
mod error;
mod io;
mod meta;
pub mod quantity;
mod retry;
mod scalar;
mod template;
mod workflow;

use serde::de::DeserializeOwned;

pub use error::ConfigError;
pub use io::{Arguments, Artifact, Inputs, Outputs, Parameter, ValueFrom};
pub use meta::ObjectMeta;
pub use retry::{Backoff, RetryPolicy, RetryStrategy};
pub use template::{
  Container, ContinueOn, DagTask, DagTemplate, EnvVar, EnvVarSource, FieldRef, IntOrString,
  Iteration, ParallelSteps, ResourceAction, ResourceRequirements, ResourceTemplate, Script, Sequence, SuspendTemplate,
  Template, TemplateKind, TemplateRef, VolumeMount, WorkflowStep,
};
pub use workflow::{
  PodGc, PodGcStrategy, ShutdownStrategy, TtlStrategy, WorkflowSpec, WorkflowTemplateRef,
};

/// Parse a manifest from text, accepting either JSON or YAML.
///
/// JSON is tried when the first non-whitespace character opens an object;
/// everything else goes through the YAML parser.
pub fn parse_manifest<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
  if text.trim_start().starts_with('{') {
    Ok(serde_json::from_str(text)?)
  } else {
    Ok(serde_yaml::from_str(text)?)
  }
}
