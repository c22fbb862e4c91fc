//! An in-memory cluster with a kubelet that plays pods out on a timer.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use loom_cluster::{
  Api, ContainerState, DeleteParams, MemoryApi, MemoryCluster, Pod, PodPhase, PodSignaler,
  TaskResult,
};
use loom_config::{ObjectMeta, WorkflowSpec};
use loom_controller::{Controller, ControllerConfig};
use loom_workflow::contract::{
  ANNOTATION_NODE_NAME, LABEL_NODE_ID, LABEL_WORKFLOW, MAIN_CONTAINER,
};
use loom_workflow::Workflow;

const TICK: Duration = Duration::from_millis(20);
/// How long a terminated pod marked for deletion lingers before removal.
const LINGER: Duration = Duration::from_millis(500);

/// How a pod behaves once started.
#[derive(Debug, Clone, Copy)]
pub struct Plan {
  pub runtime: Duration,
  pub exit_code: i32,
}

impl Plan {
  pub fn exit(exit_code: i32) -> Self {
    Self {
      runtime: Duration::from_millis(100),
      exit_code,
    }
  }

  pub fn sleep(runtime: Duration) -> Self {
    Self {
      runtime,
      exit_code: 0,
    }
  }
}

/// Picks a plan from the node name of a pod.
pub type Behaviour = Arc<dyn Fn(&str) -> Plan + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Finished {
  pub pod: String,
  pub node_name: String,
  pub created: Option<DateTime<Utc>>,
  pub finished: DateTime<Utc>,
  pub exit_code: i32,
}

#[derive(Default)]
struct State {
  started: HashMap<String, (Instant, Plan)>,
  terminating: HashSet<String>,
  finished_at: HashMap<String, Instant>,
  signals: Vec<(String, i32)>,
  history: Vec<Finished>,
  max_running: usize,
}

pub struct FakeKubelet {
  pods: Arc<MemoryApi<Pod>>,
  results: Arc<MemoryApi<TaskResult>>,
  behaviour: Behaviour,
  state: Mutex<State>,
}

impl FakeKubelet {
  pub fn new(cluster: &MemoryCluster, behaviour: Behaviour) -> Self {
    Self {
      pods: cluster.pods.clone(),
      results: cluster.task_results.clone(),
      behaviour,
      state: Mutex::new(State::default()),
    }
  }

  pub fn history(&self) -> Vec<Finished> {
    self.state.lock().history.clone()
  }

  pub fn signals(&self) -> Vec<(String, i32)> {
    self.state.lock().signals.clone()
  }

  pub fn max_running(&self) -> usize {
    self.state.lock().max_running
  }

  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(TICK) => {}
      }
      self.tick().await;
    }
  }

  async fn tick(&self) {
    for pod in self.pods.snapshot() {
      let name = pod.metadata.name.clone();
      match pod.status.phase {
        PodPhase::Pending if pod.metadata.is_deleting() => self.remove(&name).await,
        PodPhase::Pending => self.start(pod).await,
        PodPhase::Running | PodPhase::Unknown => {
          let due = {
            let mut state = self.state.lock();
            let killed = state.terminating.contains(&name) || pod.metadata.is_deleting();
            let (since, plan) = *state
              .started
              .entry(name.clone())
              .or_insert_with(|| (Instant::now(), (self.behaviour)(node_name(&pod))));
            if killed {
              Some(143)
            } else {
              (since.elapsed() >= plan.runtime).then_some(plan.exit_code)
            }
          };
          if let Some(code) = due {
            self.finish(pod, code).await;
          }
        }
        PodPhase::Succeeded | PodPhase::Failed => {
          let lingered = self
            .state
            .lock()
            .finished_at
            .get(&name)
            .is_none_or(|at| at.elapsed() >= LINGER);
          if pod.metadata.is_deleting() && lingered {
            self.remove(&name).await;
          }
        }
      }
    }
    let running = self
      .pods
      .snapshot()
      .iter()
      .filter(|p| p.status.phase == PodPhase::Running)
      .count();
    let mut state = self.state.lock();
    state.max_running = state.max_running.max(running);
  }

  async fn start(&self, mut pod: Pod) {
    let now = Utc::now();
    pod.status.phase = PodPhase::Running;
    pod.status.start_time = Some(now);
    pod.set_container_state(MAIN_CONTAINER, ContainerState::Running { started_at: Some(now) });
    let name = pod.metadata.name.clone();
    let plan = (self.behaviour)(node_name(&pod));
    if self.pods.replace(pod).await.is_ok() {
      self.state.lock().started.insert(name, (Instant::now(), plan));
    }
  }

  async fn finish(&self, mut pod: Pod, exit_code: i32) {
    let now = Utc::now();
    let node_id = pod.metadata.label(LABEL_NODE_ID).unwrap_or_default().to_string();
    let workflow = pod.metadata.label(LABEL_WORKFLOW).unwrap_or_default().to_string();
    let result = TaskResult {
      metadata: ObjectMeta::new(&pod.metadata.namespace, &node_id).with_label(LABEL_WORKFLOW, &workflow),
      ..Default::default()
    };
    // Written before the pod turns terminal, the way the wait container does.
    let _ = self.results.create(result).await;

    let started_at = pod.status.start_time;
    pod.status.phase = if exit_code == 0 {
      PodPhase::Succeeded
    } else {
      PodPhase::Failed
    };
    pod.set_container_state(
      MAIN_CONTAINER,
      ContainerState::Terminated {
        exit_code,
        reason: None,
        message: None,
        started_at,
        finished_at: Some(now),
      },
    );
    let record = Finished {
      pod: pod.metadata.name.clone(),
      node_name: node_name(&pod).to_string(),
      created: pod.metadata.creation_timestamp,
      finished: now,
      exit_code,
    };
    if self.pods.replace(pod).await.is_ok() {
      let mut state = self.state.lock();
      state.finished_at.insert(record.pod.clone(), Instant::now());
      state.history.push(record);
    }
  }

  async fn remove(&self, name: &str) {
    let _ = self
      .pods
      .delete("default", name, &DeleteParams::immediate())
      .await;
  }
}

#[async_trait]
impl PodSignaler for FakeKubelet {
  async fn signal(&self, _namespace: &str, pod: &str, signal: i32) -> loom_cluster::Result<()> {
    let mut state = self.state.lock();
    state.signals.push((pod.to_string(), signal));
    state.terminating.insert(pod.to_string());
    Ok(())
  }
}

fn node_name(pod: &Pod) -> &str {
  pod.metadata.annotation(ANNOTATION_NODE_NAME).unwrap_or_default()
}

pub struct Env {
  pub cluster: MemoryCluster,
  pub kubelet: Arc<FakeKubelet>,
  cancel: CancellationToken,
  tasks: Vec<JoinHandle<()>>,
}

pub fn fast_config() -> ControllerConfig {
  ControllerConfig {
    workers: 4,
    gc_interval: Duration::from_millis(200),
    pod_termination_grace: Duration::from_secs(1),
    pod_gc_grace: Duration::ZERO,
    ..Default::default()
  }
}

impl Env {
  pub async fn start(config: ControllerConfig, behaviour: Behaviour) -> Self {
    let cluster = MemoryCluster::new();
    let kubelet = Arc::new(FakeKubelet::new(&cluster, behaviour));
    let cancel = CancellationToken::new();
    let controller = Controller::new(cluster.cluster(), kubelet.clone(), config, None);
    let run = cancel.clone();
    let tasks = vec![
      tokio::spawn(async move {
        controller.run(run).await.expect("controller runs");
      }),
      tokio::spawn(kubelet.clone().run(cancel.clone())),
    ];
    Self {
      cluster,
      kubelet,
      cancel,
      tasks,
    }
  }

  pub async fn submit(&self, manifest: &str) {
    let spec: WorkflowSpec = serde_yaml::from_str(manifest).expect("manifest parses");
    self
      .cluster
      .workflows
      .create(Workflow::new("default", "wf", spec))
      .await
      .expect("workflow created");
  }

  pub async fn workflow(&self) -> Option<Workflow> {
    self.cluster.workflows.get("default", "wf").await.ok()
  }

  /// Poll until the workflow reaches a terminal phase.
  pub async fn completed(&self) -> Workflow {
    self
      .eventually(Duration::from_secs(30), || async {
        self.workflow().await.filter(Workflow::is_completed)
      })
      .await
  }

  pub async fn eventually<T, F, Fut>(&self, limit: Duration, check: F) -> T
  where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
  {
    let start = Instant::now();
    loop {
      if let Some(value) = check().await {
        return value;
      }
      assert!(start.elapsed() < limit, "condition not reached within {limit:?}");
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
  }

  pub async fn stop(self) {
    self.cancel.cancel();
    for task in self.tasks {
      task.await.expect("task exits cleanly");
    }
  }
}
