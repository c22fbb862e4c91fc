use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use loom_config::{Template, TemplateRef, WorkflowSpec};
use loom_workflow::{TemplateLibrary, TemplateScope, Workflow, validate};

use crate::scope::Renderer;
use crate::when;

/// A workflow's templates frozen for the rest of its run.
#[derive(Debug, Clone)]
pub struct Materialized {
  /// Set when the workflow adopted a `workflowTemplateRef`.
  pub merged: Option<WorkflowSpec>,
  pub stored: BTreeMap<String, Template>,
}

/// Libraries a spec points at directly, through `workflowTemplateRef` or a
/// task's `templateRef`. Callers fetch these and repeat on the fetched specs
/// to get the closure.
pub fn referenced_scopes(spec: &WorkflowSpec) -> BTreeSet<TemplateScope> {
  let mut scopes: BTreeSet<TemplateScope> = spec
    .templates
    .iter()
    .flat_map(template_refs)
    .map(TemplateScope::from_ref)
    .collect();
  if let Some(r) = &spec.workflow_template_ref {
    scopes.insert(library_scope(&r.name, r.cluster_scope));
  }
  scopes
}

fn library_scope(name: &str, cluster: bool) -> TemplateScope {
  if cluster {
    TemplateScope::Cluster(name.to_string())
  } else {
    TemplateScope::Namespaced(name.to_string())
  }
}

fn template_refs(template: &Template) -> Vec<&TemplateRef> {
  let dag = template
    .dag
    .iter()
    .flat_map(|d| &d.tasks)
    .filter_map(|t| t.template_ref.as_ref());
  let steps = template
    .steps
    .iter()
    .flatten()
    .flatten()
    .filter_map(|s| s.template_ref.as_ref());
  dag.chain(steps).collect()
}

fn not_found(scope: &TemplateScope) -> String {
  match scope {
    TemplateScope::Namespaced(name) => format!("workflow template '{name}' not found"),
    TemplateScope::Cluster(name) => format!("cluster workflow template '{name}' not found"),
    TemplateScope::Local => "local templates not found".to_string(),
  }
}

/// The inline spec with a referenced library spec folded in; what the
/// workflow sets itself wins.
fn merge(own: &WorkflowSpec, library: &WorkflowSpec) -> WorkflowSpec {
  let mut merged = own.clone();
  for template in &library.templates {
    if merged.template(&template.name).is_none() {
      merged.templates.push(template.clone());
    }
  }
  if merged.entrypoint.is_empty() {
    merged.entrypoint = library.entrypoint.clone();
  }
  for param in &library.arguments.parameters {
    if merged.arguments.parameter(&param.name).is_none() {
      merged.arguments.parameters.push(param.clone());
    }
  }
  for artifact in &library.arguments.artifacts {
    if merged.arguments.artifact(&artifact.name).is_none() {
      merged.arguments.artifacts.push(artifact.clone());
    }
  }
  merged.parallelism = own.parallelism.or(library.parallelism);
  merged.active_deadline_seconds = own
    .active_deadline_seconds
    .or(library.active_deadline_seconds);
  merged.ttl_strategy = own.ttl_strategy.or(library.ttl_strategy);
  merged.pod_gc = own.pod_gc.clone().or(library.pod_gc.clone());
  merged.retry_strategy = own.retry_strategy.clone().or(library.retry_strategy.clone());
  merged
}

/// Resolve every template the workflow can reach, validate the result and
/// syntax-check its expressions. Errors are user errors and end the workflow.
pub fn materialize(
  workflow: &Workflow,
  libraries: &BTreeMap<TemplateScope, WorkflowSpec>,
  renderer: &Renderer,
) -> Result<Materialized, String> {
  let merged = match &workflow.spec.workflow_template_ref {
    Some(r) => {
      let scope = library_scope(&r.name, r.cluster_scope);
      let library = libraries.get(&scope).ok_or_else(|| not_found(&scope))?;
      Some(merge(&workflow.spec, library))
    }
    None => None,
  };
  let spec = merged.as_ref().unwrap_or(&workflow.spec);

  let mut library = TemplateLibrary::new();
  library
    .add_scope(TemplateScope::Local, &spec.templates)
    .map_err(|e| e.to_string())?;

  let mut pending: Vec<TemplateScope> = spec
    .templates
    .iter()
    .flat_map(template_refs)
    .map(TemplateScope::from_ref)
    .collect();
  let mut seen = BTreeSet::new();
  while let Some(scope) = pending.pop() {
    if !seen.insert(scope.clone()) {
      continue;
    }
    let lib = libraries.get(&scope).ok_or_else(|| not_found(&scope))?;
    library
      .add_scope(scope, &lib.templates)
      .map_err(|e| e.to_string())?;
    pending.extend(
      lib
        .templates
        .iter()
        .flat_map(template_refs)
        .map(TemplateScope::from_ref),
    );
  }

  validate(spec, &library).map_err(|e| e.to_string())?;

  for (_, template) in library.iter() {
    check_expressions(renderer, template).map_err(|e| format!("template '{}': {e}", template.name))?;
  }

  Ok(Materialized {
    stored: library.to_stored(),
    merged,
  })
}

fn check_expressions(renderer: &Renderer, template: &Template) -> Result<(), String> {
  let payload = serde_json::to_value(template).map_err(|e| e.to_string())?;
  check_strings(renderer, &payload)?;

  let dag_conditions = template
    .dag
    .iter()
    .flat_map(|d| &d.tasks)
    .filter_map(|t| t.when.as_deref());
  let step_conditions = template
    .steps
    .iter()
    .flatten()
    .flatten()
    .filter_map(|s| s.when.as_deref());
  for condition in dag_conditions.chain(step_conditions) {
    when::evaluate(renderer, &blank_references(condition))?;
  }
  Ok(())
}

fn check_strings(renderer: &Renderer, value: &Value) -> Result<(), String> {
  match value {
    Value::String(s) => renderer.check(s).map_err(|e| e.to_string()),
    Value::Array(items) => items.iter().try_for_each(|v| check_strings(renderer, v)),
    Value::Object(fields) => fields.values().try_for_each(|v| check_strings(renderer, v)),
    _ => Ok(()),
  }
}

/// Replace every `{{...}}` with a literal so a condition can be parsed
/// before its values exist.
fn blank_references(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut rest = text;
  while let Some(open) = rest.find("{{") {
    out.push_str(&rest[..open]);
    match rest[open..].find("}}") {
      Some(close) => {
        out.push('0');
        rest = &rest[open + close + 2..];
      }
      None => {
        rest = &rest[open..];
        break;
      }
    }
  }
  out.push_str(rest);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use loom_config::parse_manifest;
  use loom_config::WorkflowTemplateRef;

  fn spec(text: &str) -> WorkflowSpec {
    parse_manifest(text).unwrap()
  }

  #[test]
  fn test_template_refs_are_frozen() {
    let own = spec(
      r#"
entrypoint: main
templates:
  - name: main
    dag:
      tasks:
        - name: a
          templateRef: { name: lib, template: echo }
"#,
    );
    let lib = spec(
      r#"
templates:
  - name: echo
    container: { image: alpine, command: [echo] }
"#,
    );
    let wf = Workflow::new("default", "wf", own.clone());
    assert_eq!(
      referenced_scopes(&own),
      BTreeSet::from([TemplateScope::Namespaced("lib".into())])
    );

    let err = materialize(&wf, &BTreeMap::new(), &Renderer::new()).unwrap_err();
    assert_eq!(err, "workflow template 'lib' not found");

    let libraries = BTreeMap::from([(TemplateScope::Namespaced("lib".into()), lib)]);
    let out = materialize(&wf, &libraries, &Renderer::new()).unwrap();
    assert!(out.merged.is_none());
    assert_eq!(out.stored.len(), 2);
  }

  #[test]
  fn test_workflow_template_ref_merges() {
    let mut own = WorkflowSpec::default();
    own.workflow_template_ref = Some(WorkflowTemplateRef {
      name: "lib".into(),
      cluster_scope: true,
    });
    let lib = spec(
      r#"
entrypoint: hello
arguments:
  parameters: [{ name: msg, value: hi }]
templates:
  - name: hello
    container: { image: alpine, command: [echo, "{{workflow.parameters.msg}}"] }
"#,
    );
    let libraries = BTreeMap::from([(TemplateScope::Cluster("lib".into()), lib)]);
    let wf = Workflow::new("default", "wf", own);
    let merged = materialize(&wf, &libraries, &Renderer::new())
      .unwrap()
      .merged
      .unwrap();
    assert_eq!(merged.entrypoint, "hello");
    assert_eq!(merged.arguments.parameter("msg").unwrap().value.as_deref(), Some("hi"));
  }

  #[test]
  fn test_bad_when_is_rejected() {
    let own = spec(
      r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - name: a
          template: leaf
          when: "{{inputs.parameters.x}} == == 3"
  - name: leaf
    container: { image: alpine }
"#,
    );
    let wf = Workflow::new("default", "wf", own);
    let err = materialize(&wf, &BTreeMap::new(), &Renderer::new()).unwrap_err();
    assert!(err.starts_with("template 'main'"), "{err}");
  }

  #[test]
  fn test_blank_references() {
    assert_eq!(blank_references("{{a.b}} == heads"), "0 == heads");
    assert_eq!(blank_references("x"), "x");
  }
}
