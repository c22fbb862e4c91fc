//! Wires informers, the work queue, workers, timers and retention together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use loom_archive::WorkflowArchive;
use loom_cluster::{Cluster, LabelSelector, ListParams, PodSignaler};
use loom_config::ObjectMeta;
use loom_workflow::contract::LABEL_WORKFLOW;

use crate::backoff::RequeueBackoff;
use crate::config::{ArchiveSettings, ControllerConfig};
use crate::deps::{Caches, Dependencies};
use crate::error::{ControllerError, Result};
use crate::events::{ClusterRecorder, EventRecorder};
use crate::informer::{Informer, workflow_owner};
use crate::orchestrator::PodOrchestrator;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::retention::Retention;
use crate::timer::TimerWheel;

/// Open the configured archive, if any.
pub async fn open_archive(settings: Option<&ArchiveSettings>) -> Result<Option<WorkflowArchive>> {
  match settings {
    Some(settings) => Ok(Some(WorkflowArchive::connect(&settings.database_url).await?)),
    None => Ok(None),
  }
}

pub struct Controller {
  deps: Arc<Dependencies>,
}

struct Worker {
  reconciler: Reconciler,
  queue: Arc<WorkQueue>,
  timers: Arc<TimerWheel>,
  backoff: RequeueBackoff,
}

impl Controller {
  pub fn new(
    cluster: Cluster,
    signaler: Arc<dyn PodSignaler>,
    config: ControllerConfig,
    archive: Option<WorkflowArchive>,
  ) -> Self {
    let recorder: Arc<dyn EventRecorder> = Arc::new(ClusterRecorder::new(
      cluster.events.clone(),
      config.node_events,
      config.workflow_events,
    ));
    Self::with_recorder(cluster, signaler, config, archive, recorder)
  }

  pub fn with_recorder(
    cluster: Cluster,
    signaler: Arc<dyn PodSignaler>,
    config: ControllerConfig,
    archive: Option<WorkflowArchive>,
    recorder: Arc<dyn EventRecorder>,
  ) -> Self {
    let orchestrator = PodOrchestrator::new(
      cluster.pods.clone(),
      cluster.config_maps.clone(),
      signaler,
      config.executor.clone(),
      config.pod_termination_grace,
      config.resource_rate_limit.quota(),
    );
    Self {
      deps: Arc::new(Dependencies {
        cluster,
        caches: Caches::new(),
        orchestrator,
        recorder,
        archive,
        config,
      }),
    }
  }

  pub fn caches(&self) -> &Caches {
    &self.deps.caches
  }

  /// Run until `cancel` fires. Returns once every task has stopped.
  pub async fn run(self, cancel: CancellationToken) -> Result<()> {
    self.deps.config.validate()?;
    let config = &self.deps.config;
    let cluster = &self.deps.cluster;
    let caches = &self.deps.caches;
    let queue = Arc::new(WorkQueue::new());
    let timers = Arc::new(TimerWheel::new());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let scope = || match &config.namespace {
      Some(namespace) => ListParams::namespaced(namespace.clone()),
      None => ListParams::all(),
    };
    let labelled = || scope().with_selector(LabelSelector::new().exists(LABEL_WORKFLOW));

    let enqueue_self = {
      let queue = queue.clone();
      move |meta: &ObjectMeta| queue.add(meta.key())
    };
    let enqueue_owner = {
      let queue = queue.clone();
      move |meta: &ObjectMeta| {
        if let Some(owner) = workflow_owner(meta) {
          queue.add(owner);
        }
      }
    };

    let informer = Informer::new(cluster.workflows.clone(), scope(), caches.workflows.clone());
    tasks.push(tokio::spawn(informer.run(
      move |w| enqueue_self(&w.metadata),
      cancel.clone(),
    )));
    let informer = Informer::new(cluster.pods.clone(), labelled(), caches.pods.clone());
    let on_pod = enqueue_owner.clone();
    tasks.push(tokio::spawn(informer.run(
      move |p| on_pod(&p.metadata),
      cancel.clone(),
    )));
    let informer = Informer::new(cluster.task_results.clone(), labelled(), caches.results.clone());
    tasks.push(tokio::spawn(informer.run(
      move |r| enqueue_owner(&r.metadata),
      cancel.clone(),
    )));
    let informer = Informer::new(cluster.groups.clone(), scope(), caches.groups.clone());
    tasks.push(tokio::spawn(informer.run(|_| {}, cancel.clone())));

    tokio::select! {
      _ = cancel.cancelled() => {
        queue.shutdown();
        return join(tasks).await;
      }
      _ = async {
        caches.workflows.wait_synced().await;
        caches.pods.wait_synced().await;
        caches.results.wait_synced().await;
      } => {}
    }
    info!(
      workers = config.workers,
      namespace = config.namespace.as_deref().unwrap_or("*"),
      workflows = caches.workflows.len(),
      "controller started"
    );

    tasks.push(tokio::spawn(timers.clone().run(queue.clone(), cancel.clone())));
    let worker = Arc::new(Worker {
      reconciler: Reconciler::new(self.deps.clone()),
      queue: queue.clone(),
      timers,
      backoff: RequeueBackoff::new(&config.requeue),
    });
    for _ in 0..config.workers {
      tasks.push(tokio::spawn(worker.clone().work()));
    }
    tasks.push(tokio::spawn(Retention::new(self.deps.clone()).run(cancel.clone())));

    cancel.cancelled().await;
    info!("controller stopping");
    queue.shutdown();
    join(tasks).await
  }
}

impl Worker {
  async fn work(self: Arc<Self>) {
    while let Some(key) = self.queue.get().await {
      self.process(&key).await;
      self.queue.done(&key);
    }
  }

  async fn process(&self, key: &str) {
    let timeout = self.reconciler.deps().config.reconcile_timeout;
    let result = match tokio::time::timeout(timeout, self.reconciler.reconcile(key)).await {
      Ok(result) => result,
      Err(_) => Err(ControllerError::Timeout {
        key: key.to_string(),
        timeout,
      }),
    };
    match result {
      Ok(requeue) => {
        self.backoff.forget(key);
        if let Some(delay) = requeue {
          self.timers.schedule(key, delay);
        }
      }
      Err(err) if err.is_transient() => {
        self.reconciler.forget(key);
        let delay = self.backoff.next(key);
        warn!(workflow = %key, error = %err, ?delay, attempt = self.backoff.failures(key), "reconcile failed; retrying");
        self.timers.schedule(key, delay);
      }
      Err(err) => error!(workflow = %key, error = %err, "reconcile failed"),
    }
  }
}

async fn join(tasks: Vec<JoinHandle<()>>) -> Result<()> {
  for task in tasks {
    if let Err(err) = task.await
      && err.is_panic()
    {
      error!(error = %err, "controller task panicked");
    }
  }
  Ok(())
}
