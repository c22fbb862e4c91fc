use serde::{Deserialize, Serialize};

/// Lifecycle phase of a single node.
///
/// ```text
/// Pending ─▶ Running ─▶ Succeeded | Failed | Error
///    │
///    └────▶ Skipped | Omitted | Failed | Error
/// ```
///
/// Terminal phases never change again. `Pending -> Failed | Error` covers
/// nodes that are cancelled or fail resolution before anything ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodePhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Error,
  Skipped,
  Omitted,
}

impl NodePhase {
  pub fn is_fulfilled(self) -> bool {
    !matches!(self, NodePhase::Pending | NodePhase::Running)
  }

  /// Counts as success for dependents and composite roll-ups.
  pub fn is_successful(self) -> bool {
    matches!(self, NodePhase::Succeeded | NodePhase::Skipped)
  }

  pub fn is_failure(self) -> bool {
    matches!(self, NodePhase::Failed | NodePhase::Error)
  }

  /// Whether `next` is a single allowed step from `self`. Staying put is
  /// always allowed.
  pub fn can_transition_to(self, next: NodePhase) -> bool {
    use NodePhase::*;
    if self == next {
      return true;
    }
    match self {
      Pending => matches!(next, Running | Skipped | Omitted | Failed | Error),
      Running => matches!(next, Succeeded | Failed | Error),
      Succeeded | Failed | Error | Skipped | Omitted => false,
    }
  }

  /// Whether `next` can be reached from `self` through any number of steps.
  pub fn can_reach(self, next: NodePhase) -> bool {
    self.can_transition_to(next)
      || (self == NodePhase::Pending && NodePhase::Running.can_transition_to(next))
  }

  pub fn as_str(self) -> &'static str {
    match self {
      NodePhase::Pending => "Pending",
      NodePhase::Running => "Running",
      NodePhase::Succeeded => "Succeeded",
      NodePhase::Failed => "Failed",
      NodePhase::Error => "Error",
      NodePhase::Skipped => "Skipped",
      NodePhase::Omitted => "Omitted",
    }
  }
}

impl std::fmt::Display for NodePhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowPhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Error,
}

impl WorkflowPhase {
  pub fn is_completed(self) -> bool {
    matches!(
      self,
      WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      WorkflowPhase::Pending => "Pending",
      WorkflowPhase::Running => "Running",
      WorkflowPhase::Succeeded => "Succeeded",
      WorkflowPhase::Failed => "Failed",
      WorkflowPhase::Error => "Error",
    }
  }
}

impl std::fmt::Display for WorkflowPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL: [NodePhase; 7] = [
    NodePhase::Pending,
    NodePhase::Running,
    NodePhase::Succeeded,
    NodePhase::Failed,
    NodePhase::Error,
    NodePhase::Skipped,
    NodePhase::Omitted,
  ];

  #[test]
  fn test_terminal_phases_are_final() {
    for from in ALL.into_iter().filter(|p| p.is_fulfilled()) {
      for to in ALL.into_iter().filter(|p| *p != from) {
        assert!(!from.can_transition_to(to), "{from} -> {to}");
        assert!(!from.can_reach(to), "{from} ~> {to}");
      }
    }
  }

  #[test]
  fn test_pending_reaches_everything() {
    for to in ALL {
      assert!(NodePhase::Pending.can_reach(to), "Pending ~> {to}");
    }
    assert!(!NodePhase::Pending.can_transition_to(NodePhase::Succeeded));
  }

  #[test]
  fn test_running_never_goes_back() {
    assert!(!NodePhase::Running.can_reach(NodePhase::Pending));
    assert!(!NodePhase::Running.can_reach(NodePhase::Skipped));
    assert!(NodePhase::Running.can_reach(NodePhase::Error));
  }
}
