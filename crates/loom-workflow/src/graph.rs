use std::collections::{BTreeMap, BTreeSet};

use loom_config::DagTemplate;

use crate::depends::DependsExpr;
use crate::error::WorkflowError;

/// Dependency graph of a DAG template's tasks.
#[derive(Debug, Clone)]
pub struct DagGraph {
  /// task -> tasks that depend on it.
  adjacency: BTreeMap<String, Vec<String>>,
  /// task -> tasks it depends on.
  reverse_adjacency: BTreeMap<String, Vec<String>>,
  /// Parsed `depends` expressions by task.
  depends: BTreeMap<String, DependsExpr>,
}

impl DagGraph {
  /// Build the graph. `template` names the owning template in errors.
  pub fn new(template: &str, dag: &DagTemplate) -> Result<Self, WorkflowError> {
    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut reverse_adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut depends = BTreeMap::new();

    for task in &dag.tasks {
      adjacency.entry(task.name.clone()).or_default();
      reverse_adjacency.entry(task.name.clone()).or_default();
    }

    for task in &dag.tasks {
      let upstream: Vec<String> = match &task.depends {
        Some(text) => {
          let expr = DependsExpr::parse(text)?;
          let names = expr.tasks().into_iter().map(str::to_string).collect();
          depends.insert(task.name.clone(), expr);
          names
        }
        None => task.dependencies.clone(),
      };

      for dep in upstream {
        if !adjacency.contains_key(&dep) {
          return Err(WorkflowError::UnknownDependency {
            template: template.to_string(),
            task: task.name.clone(),
            dependency: dep,
          });
        }
        adjacency.entry(dep.clone()).or_default().push(task.name.clone());
        reverse_adjacency
          .entry(task.name.clone())
          .or_default()
          .push(dep);
      }
    }

    let graph = Self {
      adjacency,
      reverse_adjacency,
      depends,
    };
    graph.topological_order().map_err(|task| WorkflowError::Cycle {
      template: template.to_string(),
      task,
    })?;
    Ok(graph)
  }

  /// Tasks a task waits on.
  pub fn upstream(&self, task: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(task)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Tasks waiting on a task.
  pub fn downstream(&self, task: &str) -> &[String] {
    self
      .adjacency
      .get(task)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn depends(&self, task: &str) -> Option<&DependsExpr> {
    self.depends.get(task)
  }

  /// Tasks with no upstream.
  pub fn entry_points(&self) -> Vec<&str> {
    self
      .reverse_adjacency
      .iter()
      .filter(|(_, up)| up.is_empty())
      .map(|(task, _)| task.as_str())
      .collect()
  }

  /// Kahn's algorithm with lexicographic tie-breaks, so the order is the same
  /// on every call. On a cycle, returns a task on it.
  pub fn topological_order(&self) -> Result<Vec<String>, String> {
    let mut remaining: BTreeMap<&str, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(task, up)| (task.as_str(), up.len()))
      .collect();
    let mut ready: BTreeSet<&str> = remaining
      .iter()
      .filter(|(_, n)| **n == 0)
      .map(|(t, _)| *t)
      .collect();

    let mut order = Vec::with_capacity(remaining.len());
    while let Some(task) = ready.pop_first() {
      remaining.remove(task);
      order.push(task.to_string());
      for next in self.downstream(task) {
        if let Some(count) = remaining.get_mut(next.as_str()) {
          *count -= 1;
          if *count == 0 {
            ready.insert(next.as_str());
          }
        }
      }
    }

    match remaining.keys().next() {
      Some(task) => Err(task.to_string()),
      None => Ok(order),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use loom_config::DagTask;

  fn task(name: &str, deps: &[&str]) -> DagTask {
    DagTask {
      name: name.to_string(),
      template: "t".to_string(),
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  fn dag(tasks: Vec<DagTask>) -> DagTemplate {
    DagTemplate {
      tasks,
      fail_fast: None,
    }
  }

  #[test]
  fn test_diamond_order() {
    let graph = DagGraph::new(
      "diamond",
      &dag(vec![
        task("D", &["B", "C"]),
        task("C", &["A"]),
        task("B", &["A"]),
        task("A", &[]),
      ]),
    )
    .unwrap();

    assert_eq!(graph.topological_order().unwrap(), vec!["A", "B", "C", "D"]);
    assert_eq!(graph.entry_points(), vec!["A"]);
    assert_eq!(graph.upstream("D"), &["B".to_string(), "C".to_string()]);
    assert_eq!(graph.downstream("A").len(), 2);
  }

  #[test]
  fn test_cycle_is_rejected() {
    let err = DagGraph::new(
      "loop",
      &dag(vec![task("A", &["C"]), task("B", &["A"]), task("C", &["B"])]),
    )
    .unwrap_err();
    assert!(matches!(err, WorkflowError::Cycle { .. }));
  }

  #[test]
  fn test_dangling_dependency_is_rejected() {
    let err = DagGraph::new("dangling", &dag(vec![task("A", &["ghost"])])).unwrap_err();
    match err {
      WorkflowError::UnknownDependency { dependency, .. } => assert_eq!(dependency, "ghost"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn test_depends_expression_edges() {
    let mut handler = task("cleanup", &[]);
    handler.depends = Some("work.Failed || work.Errored".to_string());
    let graph = DagGraph::new("h", &dag(vec![task("work", &[]), handler])).unwrap();
    assert_eq!(graph.upstream("cleanup"), &["work".to_string()]);
    assert!(graph.depends("cleanup").unwrap().handles_failure_of("work"));
  }
}
