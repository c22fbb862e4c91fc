use std::sync::Arc;

use loom_workflow::{ClusterWorkflowTemplate, Workflow, WorkflowGroup, WorkflowTemplate};

use crate::api::Api;
use crate::objects::{ConfigMap, DynamicObject, Event, TaskResult};
use crate::pod::Pod;

/// Handles to every kind loom touches. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
  pub workflows: Arc<dyn Api<Workflow>>,
  pub workflow_templates: Arc<dyn Api<WorkflowTemplate>>,
  pub cluster_workflow_templates: Arc<dyn Api<ClusterWorkflowTemplate>>,
  pub groups: Arc<dyn Api<WorkflowGroup>>,
  pub pods: Arc<dyn Api<Pod>>,
  pub task_results: Arc<dyn Api<TaskResult>>,
  pub events: Arc<dyn Api<Event>>,
  pub config_maps: Arc<dyn Api<ConfigMap>>,
  /// Arbitrary objects managed by resource templates.
  pub objects: Arc<dyn Api<DynamicObject>>,
}
