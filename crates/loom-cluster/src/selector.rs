use std::collections::BTreeMap;
use std::fmt;

use crate::error::ClusterError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
  Equals(String, String),
  NotEquals(String, String),
  Exists(String),
  NotExists(String),
}

/// Equality-based label selector: `a=b,c!=d,e,!f`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
  requirements: Vec<Requirement>,
}

impl LabelSelector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn parse(text: &str) -> Result<Self, ClusterError> {
    let mut selector = Self::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let requirement = if let Some((k, v)) = part.split_once("!=") {
        Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
      } else if let Some((k, v)) = part.split_once('=') {
        let v = v.strip_prefix('=').unwrap_or(v);
        Requirement::Equals(k.trim().to_string(), v.trim().to_string())
      } else if let Some(k) = part.strip_prefix('!') {
        Requirement::NotExists(k.trim().to_string())
      } else {
        Requirement::Exists(part.to_string())
      };
      let key = match &requirement {
        Requirement::Equals(k, _)
        | Requirement::NotEquals(k, _)
        | Requirement::Exists(k)
        | Requirement::NotExists(k) => k,
      };
      if key.is_empty() {
        return Err(ClusterError::Invalid(format!("label selector '{text}'")));
      }
      selector.requirements.push(requirement);
    }
    Ok(selector)
  }

  pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self
      .requirements
      .push(Requirement::Equals(key.into(), value.into()));
    self
  }

  pub fn not_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self
      .requirements
      .push(Requirement::NotEquals(key.into(), value.into()));
    self
  }

  pub fn exists(mut self, key: impl Into<String>) -> Self {
    self.requirements.push(Requirement::Exists(key.into()));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.requirements.is_empty()
  }

  pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    self.requirements.iter().all(|r| match r {
      Requirement::Equals(k, v) => labels.get(k) == Some(v),
      Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
      Requirement::Exists(k) => labels.contains_key(k),
      Requirement::NotExists(k) => !labels.contains_key(k),
    })
  }
}

impl fmt::Display for LabelSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self
      .requirements
      .iter()
      .map(|r| match r {
        Requirement::Equals(k, v) => format!("{k}={v}"),
        Requirement::NotEquals(k, v) => format!("{k}!={v}"),
        Requirement::Exists(k) => k.clone(),
        Requirement::NotExists(k) => format!("!{k}"),
      })
      .collect();
    f.write_str(&parts.join(","))
  }
}
