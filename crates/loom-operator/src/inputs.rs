use loom_config::{Arguments, Artifact, Inputs, Parameter, Template};

use crate::scope::{Renderer, Scope, Unresolved};

/// Substitute a call's argument values in the caller's scope.
pub fn resolve_arguments(
  renderer: &Renderer,
  arguments: &Arguments,
  scope: &Scope,
) -> Result<Arguments, Unresolved> {
  let mut resolved = arguments.clone();
  for param in &mut resolved.parameters {
    if let Some(value) = &param.value {
      param.value = Some(renderer.substitute(value, scope)?);
    }
  }
  for artifact in &mut resolved.artifacts {
    if let Some(from) = &artifact.from {
      artifact.key = Some(renderer.substitute(from, scope)?);
      artifact.from = None;
    }
  }
  Ok(resolved)
}

/// Match resolved arguments to the template's declared inputs.
pub fn bind_inputs(template: &Template, arguments: &Arguments) -> Result<Inputs, String> {
  let mut inputs = Inputs::default();
  for declared in &template.inputs.parameters {
    let supplied = arguments
      .parameter(&declared.name)
      .and_then(Parameter::effective_value);
    let Some(value) = supplied.or(declared.effective_value()) else {
      return Err(format!(
        "inputs.parameters.{} was not supplied",
        declared.name
      ));
    };
    inputs.parameters.push(Parameter {
      name: declared.name.clone(),
      value: Some(value.to_string()),
      ..Default::default()
    });
  }

  for declared in &template.inputs.artifacts {
    let key = arguments
      .artifact(&declared.name)
      .and_then(|a| a.key.clone())
      .or_else(|| declared.key.clone());
    if key.is_none() && !declared.optional {
      return Err(format!(
        "inputs.artifacts.{} was not supplied",
        declared.name
      ));
    }
    inputs.artifacts.push(Artifact {
      name: declared.name.clone(),
      path: declared.path.clone(),
      key,
      from: None,
      optional: declared.optional,
    });
  }
  Ok(inputs)
}

/// `inputs.*` as seen from inside a template.
pub fn input_scope(scope: &mut Scope, inputs: &Inputs, leaf: bool) {
  for param in &inputs.parameters {
    if let Some(value) = &param.value {
      scope.set(format!("inputs.parameters.{}", param.name), value.clone());
    }
  }
  for artifact in &inputs.artifacts {
    if leaf {
      if let Some(path) = &artifact.path {
        scope.set(format!("inputs.artifacts.{}.path", artifact.name), path.clone());
      }
    } else if let Some(key) = &artifact.key {
      scope.set(format!("inputs.artifacts.{}", artifact.name), key.clone());
    }
  }
}

/// A leaf template with every expression substituted and its inputs bound.
pub fn render_leaf(
  renderer: &Renderer,
  template: &Template,
  inputs: &Inputs,
  scope: &Scope,
) -> Result<Template, Unresolved> {
  let raw = serde_json::to_value(template).map_err(|e| Unresolved::Invalid {
    expression: template.name.clone(),
    reason: e.to_string(),
  })?;
  let rendered = renderer.substitute_value(&raw, scope)?;
  let mut out: Template = serde_json::from_value(rendered).map_err(|e| Unresolved::Invalid {
    expression: template.name.clone(),
    reason: e.to_string(),
  })?;
  out.inputs = inputs.clone();
  Ok(out)
}
