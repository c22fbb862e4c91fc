use std::collections::BTreeSet;

use serde_json::Value;

use loom_config::duration::parse_duration;
use loom_config::{Iteration, Template, TemplateKind, TemplateRef, WorkflowSpec};

use crate::error::WorkflowError;
use crate::graph::DagGraph;
use crate::library::TemplateLibrary;
use crate::workflow::TemplateScope;

/// Structural validation of a workflow against its full template library.
///
/// Catches what can never succeed at runtime: unknown template kinds,
/// dangling references, dependency cycles, malformed `{{...}}` expressions
/// and unparsable durations.
pub fn validate(spec: &WorkflowSpec, library: &TemplateLibrary) -> Result<(), WorkflowError> {
  if spec.entrypoint.is_empty() {
    return Err(WorkflowError::MissingEntrypoint);
  }
  if library
    .resolve(&TemplateScope::Local, &spec.entrypoint, None)
    .is_none()
  {
    return Err(WorkflowError::TemplateNotFound {
      name: spec.entrypoint.clone(),
      referenced_by: "spec.entrypoint".to_string(),
    });
  }

  for param in &spec.arguments.parameters {
    if let Some(value) = &param.value {
      check_expression(value)?;
    }
  }

  for (scope, template) in library.iter() {
    validate_template(scope, template, library)?;
  }
  Ok(())
}

fn validate_template(
  scope: &TemplateScope,
  template: &Template,
  library: &TemplateLibrary,
) -> Result<(), WorkflowError> {
  let kind = template.kind()?;
  let invalid = |reason: String| WorkflowError::InvalidField {
    template: template.name.clone(),
    reason,
  };

  let payload = serde_json::to_value(template).map_err(|e| invalid(e.to_string()))?;
  check_strings(&payload)?;

  unique(
    &template.name,
    template.inputs.parameters.iter().map(|p| p.name.as_str()),
  )?;

  if let Some(retry) = &template.retry_strategy {
    if let Some(limit) = &retry.limit
      && limit.as_i64().is_none_or(|l| l < 0)
      && !is_expression(limit)
    {
      return Err(invalid(format!("retryStrategy.limit {limit:?} is not a non-negative integer")));
    }
    if let Some(backoff) = &retry.backoff {
      for d in [&backoff.duration, &backoff.cap, &backoff.max_duration]
        .into_iter()
        .flatten()
      {
        check_duration(d)?;
      }
    }
  }

  match kind {
    TemplateKind::Container(c) => {
      if c.image.is_empty() {
        return Err(invalid("container.image is required".to_string()));
      }
    }
    TemplateKind::Script(s) => {
      if s.container.image.is_empty() {
        return Err(invalid("script.image is required".to_string()));
      }
    }
    TemplateKind::Resource(r) => {
      if r.manifest.trim().is_empty() {
        return Err(invalid("resource.manifest is required".to_string()));
      }
    }
    TemplateKind::Suspend(s) => {
      if let Some(d) = &s.duration {
        check_duration(d)?;
      }
    }
    TemplateKind::Dag(dag) => {
      unique(&template.name, dag.tasks.iter().map(|t| t.name.as_str()))?;
      for task in &dag.tasks {
        check_name(&template.name, &task.name)?;
        check_reference(scope, &template.name, &task.template, task.template_ref.as_ref(), library)?;
        check_iteration(&template.name, &task.name, &task.iteration)?;
      }
      DagGraph::new(&template.name, dag)?;
    }
    TemplateKind::Steps(groups) => {
      for group in groups {
        unique(&template.name, group.iter().map(|s| s.name.as_str()))?;
        for step in group {
          check_name(&template.name, &step.name)?;
          check_reference(scope, &template.name, &step.template, step.template_ref.as_ref(), library)?;
          check_iteration(&template.name, &step.name, &step.iteration)?;
        }
      }
    }
  }

  if kind.is_leaf() {
    for param in &template.outputs.parameters {
      let sourced = param
        .value_from
        .as_ref()
        .is_some_and(|v| v.path.is_some() || v.json_path.is_some());
      if !sourced && param.value.is_none() {
        return Err(invalid(format!(
          "output parameter '{}' needs valueFrom.path or valueFrom.jsonPath",
          param.name
        )));
      }
    }
    for artifact in &template.outputs.artifacts {
      if artifact.path.is_none() {
        return Err(invalid(format!("output artifact '{}' needs a path", artifact.name)));
      }
    }
  } else if matches!(kind, TemplateKind::Dag(_) | TemplateKind::Steps(_)) {
    for param in &template.outputs.parameters {
      let sourced = param
        .value_from
        .as_ref()
        .is_some_and(|v| v.parameter.is_some());
      if !sourced && param.value.is_none() {
        return Err(invalid(format!(
          "output parameter '{}' needs valueFrom.parameter",
          param.name
        )));
      }
    }
  }
  Ok(())
}

fn check_reference(
  scope: &TemplateScope,
  owner: &str,
  name: &str,
  template_ref: Option<&TemplateRef>,
  library: &TemplateLibrary,
) -> Result<(), WorkflowError> {
  if library.resolve(scope, name, template_ref).is_some() {
    return Ok(());
  }
  let name = match template_ref {
    Some(r) => format!("{}/{}", TemplateScope::from_ref(r), r.template),
    None => name.to_string(),
  };
  Err(WorkflowError::TemplateNotFound {
    name,
    referenced_by: format!("template '{owner}'"),
  })
}

fn check_name(template: &str, name: &str) -> Result<(), WorkflowError> {
  let reason = if name.is_empty() {
    "empty"
  } else if !name
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
  {
    "not made of letters, digits, '-' and '_'"
  } else {
    return Ok(());
  };
  Err(WorkflowError::InvalidName {
    template: template.to_string(),
    name: name.to_string(),
    reason: reason.to_string(),
  })
}

fn check_iteration(template: &str, name: &str, iteration: &Iteration) -> Result<(), WorkflowError> {
  let sources = [
    iteration.with_items.is_some(),
    iteration.with_param.is_some(),
    iteration.with_sequence.is_some(),
  ];
  if sources.into_iter().filter(|s| *s).count() > 1 {
    return Err(WorkflowError::InvalidField {
      template: template.to_string(),
      reason: format!("'{name}' sets more than one of withItems, withParam, withSequence"),
    });
  }
  Ok(())
}

fn unique<'a>(template: &str, names: impl Iterator<Item = &'a str>) -> Result<(), WorkflowError> {
  let mut seen = BTreeSet::new();
  for name in names {
    if !seen.insert(name) {
      return Err(WorkflowError::InvalidName {
        template: template.to_string(),
        name: name.to_string(),
        reason: "used more than once".to_string(),
      });
    }
  }
  Ok(())
}

fn check_duration(text: &str) -> Result<(), WorkflowError> {
  if text.contains("{{") {
    return Ok(());
  }
  parse_duration(text)?;
  Ok(())
}

fn is_expression(value: &loom_config::IntOrString) -> bool {
  matches!(value, loom_config::IntOrString::String(s) if s.contains("{{"))
}

fn check_strings(value: &Value) -> Result<(), WorkflowError> {
  match value {
    Value::String(s) => check_expression(s),
    Value::Array(items) => items.iter().try_for_each(check_strings),
    Value::Object(map) => map.values().try_for_each(check_strings),
    _ => Ok(()),
  }
}

/// Every `{{` must be closed by `}}` before the next `{{`, with something in
/// between.
pub(crate) fn check_expression(text: &str) -> Result<(), WorkflowError> {
  let invalid = |reason: &str| WorkflowError::InvalidExpression {
    expression: text.to_string(),
    reason: reason.to_string(),
  };

  let mut rest = text;
  while let Some(open) = rest.find("{{") {
    let after = &rest[open + 2..];
    let close = after.find("}}").ok_or_else(|| invalid("unclosed '{{'"))?;
    let inner = &after[..close];
    if inner.contains("{{") {
      return Err(invalid("nested '{{'"));
    }
    if inner.trim().is_empty() {
      return Err(invalid("empty expression"));
    }
    rest = &after[close + 2..];
  }
  Ok(())
}
