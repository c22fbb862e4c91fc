use serde_json::Value;

use loom_config::{IntOrString, Iteration, Sequence};

use crate::scope::{Renderer, Scope, Unresolved, text};

/// The items a `withItems`/`withParam`/`withSequence` call fans out over.
pub fn expand(
  renderer: &Renderer,
  iteration: &Iteration,
  scope: &Scope,
) -> Result<Vec<Value>, Unresolved> {
  if let Some(items) = &iteration.with_items {
    return items
      .iter()
      .map(|item| renderer.substitute_value(item, scope))
      .collect();
  }
  if let Some(param) = &iteration.with_param {
    let resolved = renderer.substitute(param, scope)?;
    return match serde_json::from_str::<Value>(&resolved) {
      Ok(Value::Array(items)) => Ok(items),
      _ => Err(Unresolved::Invalid {
        expression: param.clone(),
        reason: format!("withParam value '{resolved}' is not a JSON list"),
      }),
    };
  }
  if let Some(sequence) = &iteration.with_sequence {
    return sequence_items(renderer, sequence, scope);
  }
  Ok(Vec::new())
}

fn number(
  renderer: &Renderer,
  value: Option<&IntOrString>,
  scope: &Scope,
) -> Result<Option<i64>, Unresolved> {
  let Some(value) = value else {
    return Ok(None);
  };
  match value {
    IntOrString::Int(n) => Ok(Some(*n)),
    IntOrString::String(s) => {
      let resolved = renderer.substitute(s, scope)?;
      resolved
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| Unresolved::Invalid {
          expression: s.clone(),
          reason: format!("'{resolved}' is not an integer"),
        })
    }
  }
}

fn sequence_items(
  renderer: &Renderer,
  sequence: &Sequence,
  scope: &Scope,
) -> Result<Vec<Value>, Unresolved> {
  let count = number(renderer, sequence.count.as_ref(), scope)?;
  let start = number(renderer, sequence.start.as_ref(), scope)?.unwrap_or(0);
  let end = number(renderer, sequence.end.as_ref(), scope)?;

  let values: Vec<i64> = match (count, end) {
    (Some(count), _) => (start..start + count.max(0)).collect(),
    (None, Some(end)) if end >= start => (start..=end).collect(),
    (None, Some(end)) => (end..=start).rev().collect(),
    (None, None) => {
      return Err(Unresolved::Invalid {
        expression: "withSequence".to_string(),
        reason: "needs count or end".to_string(),
      });
    }
  };
  Ok(
    values
      .into_iter()
      .map(|n| Value::String(format_number(sequence.format.as_deref(), n)))
      .collect(),
  )
}

/// printf-style `%d`, `%5d`, `%05d` and `%x`; other text is copied.
fn format_number(format: Option<&str>, n: i64) -> String {
  let Some(format) = format else {
    return n.to_string();
  };
  let Some(percent) = format.find('%') else {
    return format.to_string();
  };
  let spec = &format[percent + 1..];
  let digits = spec.chars().take_while(char::is_ascii_digit).count();
  let (flags, rest) = spec.split_at(digits);
  let Some(verb) = rest.chars().next() else {
    return format.to_string();
  };
  let zero = flags.starts_with('0');
  let width: usize = flags.parse().unwrap_or(0);
  let body = match (verb, zero) {
    ('d', true) => format!("{n:0width$}"),
    ('d', false) => format!("{n:width$}"),
    ('x', true) => format!("{n:0width$x}"),
    ('x', false) => format!("{n:width$x}"),
    _ => return format.to_string(),
  };
  format!("{}{}{}", &format[..percent], body, &rest[verb.len_utf8()..])
}

/// Short label of an item used in child node names.
pub fn label(item: &Value) -> String {
  match item {
    Value::Object(fields) => fields
      .iter()
      .map(|(k, v)| format!("{k}:{}", text(v)))
      .collect::<Vec<_>>()
      .join(","),
    other => text(other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn renderer_scope() -> (Renderer, Scope) {
    let mut scope = Scope::new();
    scope.set("tasks.gen.outputs.result", r#"["a","b"]"#);
    scope.set("inputs.parameters.n", "3");
    (Renderer::new(), scope)
  }

  #[test]
  fn test_with_items_substitutes() {
    let (r, scope) = renderer_scope();
    let iteration = Iteration {
      with_items: Some(vec![json!("x"), json!({"n": "{{inputs.parameters.n}}"})]),
      ..Default::default()
    };
    assert_eq!(
      expand(&r, &iteration, &scope).unwrap(),
      vec![json!("x"), json!({"n": "3"})]
    );
  }

  #[test]
  fn test_with_param_parses_json_list() {
    let (r, scope) = renderer_scope();
    let iteration = Iteration {
      with_param: Some("{{tasks.gen.outputs.result}}".into()),
      ..Default::default()
    };
    assert_eq!(expand(&r, &iteration, &scope).unwrap(), vec![json!("a"), json!("b")]);

    let iteration = Iteration {
      with_param: Some("{{inputs.parameters.n}}".into()),
      ..Default::default()
    };
    assert!(matches!(
      expand(&r, &iteration, &scope),
      Err(Unresolved::Invalid { .. })
    ));
  }

  #[test]
  fn test_with_sequence() {
    let (r, scope) = renderer_scope();
    let iteration = Iteration {
      with_sequence: Some(Sequence {
        count: Some(IntOrString::String("{{inputs.parameters.n}}".into())),
        start: Some(IntOrString::Int(1)),
        format: Some("worker-%02d".into()),
        ..Default::default()
      }),
      ..Default::default()
    };
    assert_eq!(
      expand(&r, &iteration, &scope).unwrap(),
      vec![json!("worker-01"), json!("worker-02"), json!("worker-03")]
    );

    let descending = Iteration {
      with_sequence: Some(Sequence {
        start: Some(IntOrString::Int(2)),
        end: Some(IntOrString::Int(0)),
        ..Default::default()
      }),
      ..Default::default()
    };
    assert_eq!(
      expand(&r, &descending, &scope).unwrap(),
      vec![json!("2"), json!("1"), json!("0")]
    );
  }

  #[test]
  fn test_labels() {
    assert_eq!(label(&json!("linux")), "linux");
    assert_eq!(label(&json!(7)), "7");
    assert_eq!(label(&json!({"a": 1, "b": "x"})), "a:1,b:x");
  }
}
