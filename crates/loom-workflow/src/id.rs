use sha2::{Digest, Sha256};

use loom_config::ObjectMeta;

/// The inputs to a node identifier.
#[derive(Debug, Clone, Copy)]
pub struct NodeKey<'a> {
  /// Id of the parent node; `None` for the root.
  pub parent: Option<&'a str>,
  /// Local name: the task or step name, the template name for the root, or
  /// the retry node's name for its attempts.
  pub name: &'a str,
  /// Iteration index or retry attempt number, when present.
  pub index: Option<usize>,
}

impl<'a> NodeKey<'a> {
  pub fn root(template: &'a str) -> Self {
    Self {
      parent: None,
      name: template,
      index: None,
    }
  }

  pub fn child(parent: &'a str, name: &'a str) -> Self {
    Self {
      parent: Some(parent),
      name,
      index: None,
    }
  }

  pub fn indexed(parent: &'a str, name: &'a str, index: usize) -> Self {
    Self {
      parent: Some(parent),
      name,
      index: Some(index),
    }
  }
}

const MAX_PREFIX: usize = 52;

/// Derive a node identifier, `<workflow>-<10 hex digits>`. The id doubles as
/// the pod name, so it stays within 63 characters.
pub fn node_id(workflow: &ObjectMeta, key: NodeKey<'_>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(workflow.namespace.as_bytes());
  hasher.update(b"/");
  hasher.update(workflow.name.as_bytes());
  hasher.update([0]);
  hasher.update(key.parent.unwrap_or_default().as_bytes());
  hasher.update([0]);
  hasher.update(key.name.as_bytes());
  hasher.update([0]);
  if let Some(index) = key.index {
    hasher.update(index.to_string().as_bytes());
  }
  let digest = hex::encode(hasher.finalize());

  let prefix: String = workflow.name.chars().take(MAX_PREFIX).collect();
  format!("{}-{}", prefix.trim_end_matches(['-', '.']), &digest[..10])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_are_stable_and_distinct() {
    let meta = ObjectMeta::new("default", "diamond");
    let root = node_id(&meta, NodeKey::root("main"));
    assert_eq!(root, node_id(&meta, NodeKey::root("main")));
    assert!(root.starts_with("diamond-"));
    assert_eq!(root.len(), "diamond-".len() + 10);

    let a = node_id(&meta, NodeKey::child(&root, "A"));
    let b = node_id(&meta, NodeKey::child(&root, "B"));
    let a0 = node_id(&meta, NodeKey::indexed(&root, "A", 0));
    let a1 = node_id(&meta, NodeKey::indexed(&root, "A", 1));
    let ids = [&root, &a, &b, &a0, &a1];
    for (i, x) in ids.iter().enumerate() {
      for y in &ids[i + 1..] {
        assert_ne!(x, y);
      }
    }
  }

  #[test]
  fn test_ids_depend_on_workflow_identity() {
    let one = node_id(&ObjectMeta::new("a", "wf"), NodeKey::root("main"));
    let two = node_id(&ObjectMeta::new("b", "wf"), NodeKey::root("main"));
    assert_ne!(one, two);
  }

  #[test]
  fn test_long_names_fit_pod_name_limit() {
    let meta = ObjectMeta::new("default", "x".repeat(80));
    assert!(node_id(&meta, NodeKey::root("main")).len() <= 63);
  }
}
