use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use loom_artifact::Store;
use loom_cluster::{
  Cluster, ClusterError, ContainerState, DeleteParams, LabelSelector, ListParams, Pod, PodPhase,
  PodSignaler,
};
use loom_executor::{
  AgentConfig, AgentPaths, ApiResultWriter, execute_resource, run_emissary, run_init, run_wait,
  signal,
};
use loom_workflow::contract::{
  AGENT_FAULT_EXIT_CODE, INIT_CONTAINER, LABEL_WORKFLOW, MAIN_CONTAINER, OFFLOAD_KEY, OFFLOADED,
  WAIT_CONTAINER,
};

use crate::error::{LocalError, Result};

const POLL: Duration = Duration::from_millis(100);
const SIGKILL: i32 = 9;
const UPDATE_ATTEMPTS: usize = 5;

type PodKey = (String, String);

struct Slot {
  cancel: CancellationToken,
  task: JoinHandle<()>,
}

/// Runs loom pods as host processes.
///
/// Each pod gets an agent directory at `<root>/<namespace>/<pod>`. The
/// directories are left in place after the pod is gone.
pub struct LocalKubelet {
  cluster: Cluster,
  root: PathBuf,
  slots: Mutex<HashMap<PodKey, Slot>>,
}

impl LocalKubelet {
  pub fn new(cluster: Cluster, root: impl Into<PathBuf>) -> Self {
    Self {
      cluster,
      root: root.into(),
      slots: Mutex::new(HashMap::new()),
    }
  }

  /// The agent directory of a pod.
  pub fn pod_dir(&self, namespace: &str, pod: &str) -> PathBuf {
    self.root.join(namespace).join(pod)
  }

  /// Poll for pods until `cancel` fires, then kill whatever is still running.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(POLL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tick.tick() => {}
      }
      if let Err(err) = self.clone().sync().await {
        warn!(error = %err, "pod sync failed");
      }
    }

    let slots: Vec<(PodKey, Slot)> = self.slots.lock().drain().collect();
    for ((namespace, name), slot) in slots {
      self.stop(&namespace, &name, slot).await;
    }
  }

  async fn sync(self: Arc<Self>) -> Result<()> {
    let params = ListParams::all().with_selector(LabelSelector::new().exists(LABEL_WORKFLOW));
    let pods = self.cluster.pods.list(&params).await?.items;

    let mut seen = HashSet::new();
    for pod in pods {
      let key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
      let started = self.slots.lock().contains_key(&key);
      seen.insert(key.clone());

      if pod.metadata.is_deleting() {
        if !started || pod.status.phase.is_terminal() {
          self.remove(&key).await;
        }
        continue;
      }
      if !started && pod.status.phase == PodPhase::Pending {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().play(pod, cancel.clone()));
        self.slots.lock().insert(key, Slot { cancel, task });
      }
    }

    let gone: Vec<(PodKey, Slot)> = {
      let mut slots = self.slots.lock();
      let keys: Vec<PodKey> = slots.keys().filter(|k| !seen.contains(*k)).cloned().collect();
      keys
        .into_iter()
        .filter_map(|key| slots.remove(&key).map(|slot| (key, slot)))
        .collect()
    };
    for ((namespace, name), slot) in gone {
      if !slot.task.is_finished() {
        debug!(pod = %name, "pod removed while running");
        self.stop(&namespace, &name, slot).await;
      }
    }
    Ok(())
  }

  async fn remove(&self, (namespace, name): &PodKey) {
    match self
      .cluster
      .pods
      .delete(namespace, name, &DeleteParams::immediate())
      .await
    {
      Ok(()) => debug!(pod = %name, "pod removed"),
      Err(err) if err.is_not_found() => {}
      Err(err) => warn!(pod = %name, error = %err, "failed to remove pod"),
    }
  }

  async fn stop(&self, namespace: &str, name: &str, slot: Slot) {
    if let Err(err) = self.signal(namespace, name, SIGKILL).await {
      warn!(pod = %name, error = %err, "failed to signal pod");
    }
    slot.cancel.cancel();
    if let Err(err) = slot.task.await
      && err.is_panic()
    {
      error!(pod = %name, error = %err, "pod task panicked");
    }
  }

  #[instrument(skip_all, fields(pod = %pod.metadata.name))]
  async fn play(self: Arc<Self>, pod: Pod, cancel: CancellationToken) {
    let namespace = pod.metadata.namespace.clone();
    let name = pod.metadata.name.clone();
    let started = Utc::now();
    let (code, message) = match self.execute(&pod, started, cancel).await {
      Ok(code) => (code, None),
      Err(err) => {
        error!(error = %err, "pod could not run");
        (AGENT_FAULT_EXIT_CODE, Some(err.to_string()))
      }
    };
    let finished = Utc::now();

    let outcome = self
      .update(&namespace, &name, |pod| {
        pod.status.phase = if code == 0 {
          PodPhase::Succeeded
        } else {
          PodPhase::Failed
        };
        pod.status.message = message.clone();
        pod.set_container_state(MAIN_CONTAINER, terminated(code, message.clone(), started, finished));
        pod.set_container_state(WAIT_CONTAINER, terminated(0, None, started, finished));
      })
      .await;
    match outcome {
      Ok(()) => info!(exit_code = code, "pod finished"),
      Err(err) if err.is_not_found() => debug!("pod deleted before it finished"),
      Err(err) => warn!(error = %err, "failed to record pod completion"),
    }
  }

  async fn execute(&self, pod: &Pod, started: DateTime<Utc>, cancel: CancellationToken) -> Result<i32> {
    let config = self.agent_config(pod).await?;
    self
      .update(&config.namespace, &config.pod_name, |pod| {
        pod.status.phase = PodPhase::Running;
        pod.status.start_time = Some(started);
        pod.set_container_state(MAIN_CONTAINER, ContainerState::Running {
          started_at: Some(started),
        });
      })
      .await?;

    let store = config.artifact_store();
    let store = store.as_ref().map(|s| s as &dyn Store);
    let template = run_init(&config, store, None).await?;
    let writer = ApiResultWriter::new(self.cluster.task_results.clone());

    if template.resource.is_some() {
      return Ok(execute_resource(&config, &template, self.cluster.objects.as_ref(), &writer).await?);
    }

    let main = pod
      .container(MAIN_CONTAINER)
      .ok_or_else(|| LocalError::MissingContainer(pod.metadata.name.clone(), MAIN_CONTAINER))?;
    let args = user_command(&main.command);
    let (code, waited) = tokio::join!(
      run_emissary(&config, &args, false),
      run_wait(&config, store, &writer, cancel),
    );
    if let Err(err) = waited {
      warn!(error = %err, "wait role failed");
    }
    Ok(code)
  }

  /// Agent settings from the init container's env, rooted in this host's pod
  /// directory.
  async fn agent_config(&self, pod: &Pod) -> Result<AgentConfig> {
    let meta = &pod.metadata;
    let init = pod
      .spec
      .init_containers
      .iter()
      .find(|c| c.name == INIT_CONTAINER)
      .ok_or_else(|| LocalError::MissingContainer(meta.name.clone(), INIT_CONTAINER))?;
    let mut config = AgentConfig::from_lookup(|name| {
      init
        .env
        .iter()
        .find(|var| var.name == name)
        .map(|var| pod.env_value(var))
    })?;
    config.root = self.pod_dir(&meta.namespace, &meta.name);

    if config.template.as_deref() == Some(OFFLOADED) {
      let map = self.cluster.config_maps.get(&meta.namespace, &meta.name).await?;
      let payload = map
        .data
        .get(OFFLOAD_KEY)
        .ok_or_else(|| LocalError::MissingTemplate(meta.name.clone()))?;
      let mount = self.root.join(&meta.namespace).join(format!("{}.template", meta.name));
      tokio::fs::create_dir_all(&mount)
        .await
        .map_err(|source| LocalError::Io {
          context: format!("create {}", mount.display()),
          source,
        })?;
      let path = mount.join(OFFLOAD_KEY);
      tokio::fs::write(&path, payload)
        .await
        .map_err(|source| LocalError::Io {
          context: format!("write {}", path.display()),
          source,
        })?;
      config.template_mount = Some(mount);
    }
    Ok(config)
  }

  /// Read-modify-write a pod, retrying on conflicts.
  async fn update(
    &self,
    namespace: &str,
    name: &str,
    change: impl Fn(&mut Pod),
  ) -> Result<(), ClusterError> {
    let mut attempt = 1;
    loop {
      let mut pod = self.cluster.pods.get(namespace, name).await?;
      change(&mut pod);
      match self.cluster.pods.replace(pod).await {
        Ok(_) => return Ok(()),
        Err(err) if err.is_conflict() && attempt < UPDATE_ATTEMPTS => attempt += 1,
        Err(err) => return Err(err),
      }
    }
  }
}

#[async_trait]
impl PodSignaler for LocalKubelet {
  async fn signal(&self, namespace: &str, pod: &str, number: i32) -> loom_cluster::Result<()> {
    let paths = AgentPaths::new(self.pod_dir(namespace, pod));
    if !tokio::fs::try_exists(paths.root()).await.unwrap_or(false) {
      debug!(pod, "pod not staged yet; signal dropped");
      return Ok(());
    }
    signal::send(&paths.signal(), number)
      .await
      .map_err(|e| ClusterError::Unavailable(e.to_string()))
  }
}

/// The user argv the orchestrator placed after `--` in the main command.
/// Empty for scripts, whose argv comes from the staged template.
fn user_command(command: &[String]) -> Vec<String> {
  command
    .iter()
    .position(|arg| arg == "--")
    .map(|at| command[at + 1..].to_vec())
    .unwrap_or_default()
}

fn terminated(
  exit_code: i32,
  message: Option<String>,
  started: DateTime<Utc>,
  finished: DateTime<Utc>,
) -> ContainerState {
  let reason = if exit_code == 0 { "Completed" } else { "Error" };
  ContainerState::Terminated {
    exit_code,
    reason: Some(reason.to_string()),
    message,
    started_at: Some(started),
    finished_at: Some(finished),
  }
}
