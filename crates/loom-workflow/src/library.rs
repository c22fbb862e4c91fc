use std::collections::BTreeMap;

use loom_config::{Template, TemplateRef};

use crate::error::WorkflowError;
use crate::workflow::{TemplateScope, stored_template_key};

/// Every template a workflow can reach: its inline templates plus the
/// libraries of any referenced workflow templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
  templates: BTreeMap<(TemplateScope, String), Template>,
}

impl TemplateLibrary {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_scope(
    &mut self,
    scope: TemplateScope,
    templates: &[Template],
  ) -> Result<(), WorkflowError> {
    for template in templates {
      let key = (scope.clone(), template.name.clone());
      if self.templates.insert(key, template.clone()).is_some() {
        return Err(WorkflowError::DuplicateTemplate(format!(
          "{scope}/{}",
          template.name
        )));
      }
    }
    Ok(())
  }

  pub fn has_scope(&self, scope: &TemplateScope) -> bool {
    self.templates.keys().any(|(s, _)| s == scope)
  }

  pub fn get(&self, scope: &TemplateScope, name: &str) -> Option<&Template> {
    self.templates.get(&(scope.clone(), name.to_string()))
  }

  /// Resolve a reference made from inside `scope`: either a plain template
  /// name (same scope) or an explicit `templateRef`.
  pub fn resolve(
    &self,
    scope: &TemplateScope,
    name: &str,
    template_ref: Option<&TemplateRef>,
  ) -> Option<(TemplateScope, &Template)> {
    match template_ref {
      Some(r) => {
        let target = TemplateScope::from_ref(r);
        self.get(&target, &r.template).map(|t| (target, t))
      }
      None => self.get(scope, name).map(|t| (scope.clone(), t)),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&TemplateScope, &Template)> {
    self.templates.iter().map(|((scope, _), t)| (scope, t))
  }

  /// The frozen form stored in `status.stored_templates`.
  pub fn to_stored(&self) -> BTreeMap<String, Template> {
    self
      .templates
      .iter()
      .map(|((scope, name), t)| (stored_template_key(scope, name), t.clone()))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn template(name: &str) -> Template {
    Template {
      name: name.to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn test_resolve_by_scope() {
    let mut library = TemplateLibrary::new();
    library
      .add_scope(TemplateScope::Local, &[template("main")])
      .unwrap();
    library
      .add_scope(TemplateScope::Namespaced("lib".into()), &[template("echo")])
      .unwrap();

    let (scope, t) = library.resolve(&TemplateScope::Local, "main", None).unwrap();
    assert_eq!(scope, TemplateScope::Local);
    assert_eq!(t.name, "main");

    let r = TemplateRef {
      name: "lib".into(),
      template: "echo".into(),
      cluster_scope: false,
    };
    let (scope, _) = library.resolve(&TemplateScope::Local, "", Some(&r)).unwrap();
    assert_eq!(scope, TemplateScope::Namespaced("lib".into()));
    assert!(library.resolve(&TemplateScope::Local, "echo", None).is_none());
    assert_eq!(library.to_stored().len(), 2);
  }

  #[test]
  fn test_duplicates_are_rejected() {
    let mut library = TemplateLibrary::new();
    let err = library
      .add_scope(TemplateScope::Local, &[template("a"), template("a")])
      .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateTemplate(_)));
  }
}
