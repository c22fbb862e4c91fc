use serde::Serialize;
use serde::de::DeserializeOwned;

use loom_config::ObjectMeta;
use loom_workflow::{ClusterWorkflowTemplate, Workflow, WorkflowGroup, WorkflowTemplate};

use crate::objects::{ConfigMap, DynamicObject, Event, TaskResult};
use crate::pod::Pod;

/// A kind of cluster object.
pub trait Resource:
  Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
  const KIND: &'static str;
  /// Deleting with a grace period only marks the object; it disappears once
  /// force-deleted.
  const GRACEFUL_DELETE: bool = false;

  fn meta(&self) -> &ObjectMeta;
  fn meta_mut(&mut self) -> &mut ObjectMeta;

  /// Called once the store has assigned identity on create.
  fn admit(&mut self) {}
}

macro_rules! resource {
  ($ty:ty, $kind:literal) => {
    resource!($ty, $kind, false);
  };
  ($ty:ty, $kind:literal, $graceful:literal) => {
    impl Resource for $ty {
      const KIND: &'static str = $kind;
      const GRACEFUL_DELETE: bool = $graceful;

      fn meta(&self) -> &ObjectMeta {
        &self.metadata
      }

      fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
      }
    }
  };
}

resource!(Workflow, "Workflow");
resource!(WorkflowTemplate, "WorkflowTemplate");
resource!(ClusterWorkflowTemplate, "ClusterWorkflowTemplate");
resource!(WorkflowGroup, "WorkflowGroup");
resource!(TaskResult, "WorkflowTaskResult");
resource!(Event, "Event");
resource!(ConfigMap, "ConfigMap");
resource!(DynamicObject, "DynamicObject");

impl Resource for Pod {
  const KIND: &'static str = "Pod";
  const GRACEFUL_DELETE: bool = true;

  fn meta(&self) -> &ObjectMeta {
    &self.metadata
  }

  fn meta_mut(&mut self) -> &mut ObjectMeta {
    &mut self.metadata
  }

  fn admit(&mut self) {
    self.resolve_field_refs();
  }
}
