use std::sync::Arc;

use loom_archive::WorkflowArchive;
use loom_cluster::{Cluster, Pod, TaskResult};
use loom_workflow::{Workflow, WorkflowGroup};

use crate::config::ControllerConfig;
use crate::events::EventRecorder;
use crate::informer::{Cache, workflow_owner};
use crate::orchestrator::PodOrchestrator;

/// The informer caches workers read from.
#[derive(Clone)]
pub struct Caches {
  pub workflows: Arc<Cache<Workflow>>,
  /// Pods indexed by owning workflow key.
  pub pods: Arc<Cache<Pod>>,
  /// Task results indexed by owning workflow key.
  pub results: Arc<Cache<TaskResult>>,
  pub groups: Arc<Cache<WorkflowGroup>>,
}

impl Caches {
  pub fn new() -> Self {
    Self {
      workflows: Arc::new(Cache::new()),
      pods: Arc::new(Cache::with_owner_index(workflow_owner)),
      results: Arc::new(Cache::with_owner_index(workflow_owner)),
      groups: Arc::new(Cache::new()),
    }
  }
}

impl Default for Caches {
  fn default() -> Self {
    Self::new()
  }
}

/// Everything a reconcile or retention pass needs, built once at startup.
pub struct Dependencies {
  pub cluster: Cluster,
  pub caches: Caches,
  pub orchestrator: PodOrchestrator,
  pub recorder: Arc<dyn EventRecorder>,
  pub archive: Option<WorkflowArchive>,
  pub config: ControllerConfig,
}

#[cfg(test)]
pub(crate) mod testing {
  use loom_cluster::{MemoryCluster, MemorySignaler};
  use tokio::sync::mpsc;

  use super::*;
  use crate::events::{ChannelRecorder, WorkflowEvent};

  pub(crate) struct Fixture {
    pub cluster: MemoryCluster,
    pub signaler: Arc<MemorySignaler>,
    pub events: mpsc::UnboundedReceiver<WorkflowEvent>,
    pub deps: Arc<Dependencies>,
  }

  pub(crate) fn fixture(config: ControllerConfig) -> Fixture {
    let cluster = MemoryCluster::new();
    let signaler = Arc::new(MemorySignaler::new());
    let (sender, events) = mpsc::unbounded_channel();
    let handles = cluster.cluster();
    let orchestrator = PodOrchestrator::new(
      handles.pods.clone(),
      handles.config_maps.clone(),
      signaler.clone(),
      config.executor.clone(),
      config.pod_termination_grace,
      config.resource_rate_limit.quota(),
    );
    let deps = Arc::new(Dependencies {
      cluster: handles,
      caches: Caches::new(),
      orchestrator,
      recorder: Arc::new(ChannelRecorder::new(sender)),
      archive: None,
      config,
    });
    Fixture {
      cluster,
      signaler,
      events,
      deps,
    }
  }
}
