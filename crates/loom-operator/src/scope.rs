//! Expression substitution: `{{inputs.parameters.msg}}`, `{{tasks.A.outputs.result}}`,
//! `{{item.name}}` and friends.
//!
//! Plain dotted references are looked up verbatim in a flat [`Scope`], so
//! task names may contain `-`. Anything else between the braces is a
//! minijinja expression over the same values nested into objects, and
//! `{{= expr}}` evaluates `expr` directly.

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Unresolved {
  /// A reference with no value (yet).
  Missing(String),
  Invalid { expression: String, reason: String },
}

impl Unresolved {
  /// The task or step a missing `tasks.X...`/`steps.X...` reference waits on.
  pub fn producer(&self) -> Option<&str> {
    let Unresolved::Missing(reference) = self else {
      return None;
    };
    let rest = reference
      .strip_prefix("tasks.")
      .or_else(|| reference.strip_prefix("steps."))?;
    rest.split('.').next()
  }
}

impl std::fmt::Display for Unresolved {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Unresolved::Missing(reference) => write!(f, "unable to resolve {{{{{reference}}}}}"),
      Unresolved::Invalid { expression, reason } => {
        write!(f, "invalid expression '{expression}': {reason}")
      }
    }
  }
}

/// Values visible to expressions at one point of the tree.
#[derive(Debug, Clone, Default)]
pub struct Scope {
  values: BTreeMap<String, String>,
  item: Option<Value>,
}

impl Scope {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.values.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str)
  }

  pub fn contains_prefix(&self, prefix: &str) -> bool {
    let dotted = format!("{prefix}.");
    self
      .values
      .range(prefix.to_string()..)
      .next()
      .is_some_and(|(k, _)| k == prefix || k.starts_with(&dotted))
  }

  /// This scope plus `item` (and `item.<key>` for object items).
  pub fn with_item(&self, item: &Value) -> Scope {
    let mut scope = self.clone();
    scope.set("item", text(item));
    if let Value::Object(fields) = item {
      for (key, value) in fields {
        scope.set(format!("item.{key}"), text(value));
      }
    }
    scope.item = Some(item.clone());
    scope
  }

  fn context(&self) -> Value {
    let mut root = Map::new();
    if let Some(item) = &self.item {
      root.insert("item".to_string(), item.clone());
    }
    for (key, value) in &self.values {
      let parts: Vec<&str> = key.split('.').collect();
      insert_path(&mut root, &parts, value);
    }
    Value::Object(root)
  }
}

fn insert_path(map: &mut Map<String, Value>, parts: &[&str], value: &str) {
  match parts {
    [] => {}
    [last] => {
      map
        .entry(last.to_string())
        .or_insert_with(|| Value::String(value.to_string()));
    }
    [head, rest @ ..] => {
      let entry = map
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
      if let Value::Object(inner) = entry {
        insert_path(inner, rest, value);
      }
    }
  }
}

/// Text form of a JSON value as it appears in a substituted string.
pub fn text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn is_reference(inner: &str) -> bool {
  !inner.is_empty()
    && inner
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub struct Renderer {
  env: Environment<'static>,
}

impl Default for Renderer {
  fn default() -> Self {
    Self::new()
  }
}

impl Renderer {
  pub fn new() -> Self {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Self { env }
  }

  /// Replace every `{{...}}` in `text`.
  pub fn substitute(&self, text: &str, scope: &Scope) -> Result<String, Unresolved> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
      out.push_str(&rest[..open]);
      let after = &rest[open + 2..];
      let Some(close) = after.find("}}") else {
        return Err(Unresolved::Invalid {
          expression: text.to_string(),
          reason: "unclosed '{{'".to_string(),
        });
      };
      out.push_str(&self.resolve(after[..close].trim(), scope)?);
      rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
  }

  /// Substitute every string inside a JSON value.
  pub fn substitute_value(&self, value: &Value, scope: &Scope) -> Result<Value, Unresolved> {
    Ok(match value {
      Value::String(s) => Value::String(self.substitute(s, scope)?),
      Value::Array(items) => Value::Array(
        items
          .iter()
          .map(|v| self.substitute_value(v, scope))
          .collect::<Result<_, _>>()?,
      ),
      Value::Object(fields) => Value::Object(
        fields
          .iter()
          .map(|(k, v)| Ok((k.clone(), self.substitute_value(v, scope)?)))
          .collect::<Result<_, Unresolved>>()?,
      ),
      other => other.clone(),
    })
  }

  /// Evaluate a standalone boolean expression with no variables.
  pub fn truthy(&self, expression: &str) -> Result<bool, String> {
    let compiled = self
      .env
      .compile_expression(expression)
      .map_err(|e| e.to_string())?;
    let value = compiled.eval(()).map_err(|e| e.to_string())?;
    Ok(value.is_true())
  }

  /// Syntax check of the non-reference expressions in `text`.
  pub fn check(&self, text: &str) -> Result<(), Unresolved> {
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
      let after = &rest[open + 2..];
      let Some(close) = after.find("}}") else {
        break;
      };
      let inner = after[..close].trim();
      let source = inner.strip_prefix('=').unwrap_or(inner);
      if !is_reference(inner) {
        self
          .env
          .compile_expression(source)
          .map_err(|e| Unresolved::Invalid {
            expression: inner.to_string(),
            reason: e.to_string(),
          })?;
      }
      rest = &after[close + 2..];
    }
    Ok(())
  }

  fn resolve(&self, inner: &str, scope: &Scope) -> Result<String, Unresolved> {
    if is_reference(inner) {
      return scope
        .get(inner)
        .map(str::to_string)
        .ok_or_else(|| Unresolved::Missing(inner.to_string()));
    }
    let source = inner.strip_prefix('=').unwrap_or(inner).trim();
    if let Some(reference) = missing_producer(source, scope) {
      return Err(Unresolved::Missing(reference));
    }
    let invalid = |e: minijinja::Error| Unresolved::Invalid {
      expression: inner.to_string(),
      reason: e.to_string(),
    };
    let compiled = self.env.compile_expression(source).map_err(invalid)?;
    let value = compiled.eval(scope.context()).map_err(invalid)?;
    Ok(value.to_string())
  }
}

/// A `tasks.X`/`steps.X` path inside a free-form expression whose producer
/// has not reported yet.
fn missing_producer(source: &str, scope: &Scope) -> Option<String> {
  let tokens = source.split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')));
  for token in tokens {
    for prefix in ["tasks.", "steps."] {
      let Some(rest) = token.strip_prefix(prefix) else {
        continue;
      };
      let producer = rest.split('.').next().unwrap_or_default();
      if !producer.is_empty() && !scope.contains_prefix(&format!("{prefix}{producer}")) {
        return Some(token.to_string());
      }
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn scope() -> Scope {
    let mut scope = Scope::new();
    scope.set("workflow.name", "wf");
    scope.set("inputs.parameters.msg", "hello");
    scope.set("tasks.gen-data.status", "Succeeded");
    scope.set("tasks.gen-data.outputs.result", "42");
    scope
  }

  #[test]
  fn test_plain_references() {
    let r = Renderer::new();
    assert_eq!(
      r.substitute("echo {{inputs.parameters.msg}} from {{ workflow.name }}", &scope())
        .unwrap(),
      "echo hello from wf"
    );
    assert_eq!(
      r.substitute("{{tasks.gen-data.outputs.result}}", &scope()).unwrap(),
      "42"
    );
    assert_eq!(r.substitute("no braces", &scope()).unwrap(), "no braces");
  }

  #[test]
  fn test_missing_reference_names_producer() {
    let r = Renderer::new();
    let err = r
      .substitute("{{tasks.fetch.outputs.parameters.url}}", &scope())
      .unwrap_err();
    assert_eq!(err.producer(), Some("fetch"));

    let err = r.substitute("{{inputs.parameters.nope}}", &scope()).unwrap_err();
    assert_eq!(err, Unresolved::Missing("inputs.parameters.nope".into()));
    assert_eq!(err.producer(), None);
  }

  #[test]
  fn test_expressions_use_minijinja() {
    let r = Renderer::new();
    assert_eq!(
      r.substitute("{{ inputs.parameters.msg | upper }}", &scope()).unwrap(),
      "HELLO"
    );
    assert_eq!(
      r.substitute("{{= workflow.name ~ '-x' }}", &scope()).unwrap(),
      "wf-x"
    );
    let err = r.substitute("{{ tasks.later.outputs.result | int }}", &scope()).unwrap_err();
    assert_eq!(err.producer(), Some("later"));
  }

  #[test]
  fn test_item_scope() {
    let r = Renderer::new();
    let item = json!({"os": "linux", "n": 2});
    let scoped = scope().with_item(&item);
    assert_eq!(r.substitute("{{item.os}}-{{item.n}}", &scoped).unwrap(), "linux-2");
    assert_eq!(r.substitute("{{ item.n + 1 }}", &scoped).unwrap(), "3");
  }

  #[test]
  fn test_invalid_expression() {
    let r = Renderer::new();
    assert!(matches!(
      r.substitute("{{ 1 + }}", &scope()),
      Err(Unresolved::Invalid { .. })
    ));
    assert!(r.check("{{ (oops }}").is_err());
    assert!(r.check("{{tasks.a.outputs.result}}").is_ok());
  }

  #[test]
  fn test_substitute_value_walks_json() {
    let r = Renderer::new();
    let value = json!({"args": ["{{inputs.parameters.msg}}", 3]});
    assert_eq!(
      r.substitute_value(&value, &scope()).unwrap(),
      json!({"args": ["hello", 3]})
    );
  }
}
