//! Turns operator intent into pods.
//!
//! Every task pod has three containers sharing the agent volume: `init`
//! stages the template and inputs, `main` runs the user command behind the
//! emissary shim, and `wait` turns the outcome into a task result.

use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, info, instrument, warn};

use loom_cluster::{
  Api, ClusterError, ConfigMap, ConfigMapVolume, DeleteParams, Pod, PodSignaler, PodSpec, Volume,
};
use loom_config::{Container, EnvVar, ObjectMeta, VolumeMount};
use loom_operator::{KillCause, PodRequest};
use loom_workflow::Workflow;
use loom_workflow::contract::{
  ANNOTATION_NODE_ID, ANNOTATION_NODE_NAME, AGENT_VOLUME, INIT_CONTAINER, LABEL_COMPLETED,
  LABEL_NODE_ID, LABEL_WORKFLOW, LABEL_WORKFLOW_NAMESPACE, MAIN_CONTAINER,
  MAX_ENV_TEMPLATE_BYTES, OFFLOAD_KEY, OFFLOADED, TEMPLATE_VOLUME, WAIT_CONTAINER, env, files,
};

use crate::config::ExecutorSettings;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;
const RELABEL_ATTEMPTS: u32 = 3;

/// Where the offloaded template config map is mounted.
const TEMPLATE_MOUNT: &str = "/var/run/loom-template";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensure {
  Created,
  /// A pod for the node is already there.
  Exists,
  /// Over the create rate or the cluster pushed back; try again shortly.
  Throttled,
  /// The node should error with this message.
  Failed(String),
}

pub struct PodOrchestrator {
  pods: Arc<dyn Api<Pod>>,
  config_maps: Arc<dyn Api<ConfigMap>>,
  signaler: Arc<dyn PodSignaler>,
  executor: ExecutorSettings,
  termination_grace: Duration,
  creates: DefaultDirectRateLimiter,
}

impl PodOrchestrator {
  pub fn new(
    pods: Arc<dyn Api<Pod>>,
    config_maps: Arc<dyn Api<ConfigMap>>,
    signaler: Arc<dyn PodSignaler>,
    executor: ExecutorSettings,
    termination_grace: Duration,
    create_quota: Quota,
  ) -> Self {
    Self {
      pods,
      config_maps,
      signaler,
      executor,
      termination_grace,
      creates: RateLimiter::direct(create_quota),
    }
  }

  /// Create the pod for `request` unless `known` (the workflow's cached pods)
  /// already has one for the node.
  #[instrument(skip_all, fields(workflow = %workflow.key(), node_id = %request.node_id))]
  pub async fn ensure_running(&self, workflow: &Workflow, request: &PodRequest, known: &[Pod]) -> Ensure {
    if known
      .iter()
      .any(|p| p.metadata.label(LABEL_NODE_ID) == Some(request.node_id.as_str()))
    {
      return Ensure::Exists;
    }
    if self.creates.check().is_err() {
      debug!("pod create throttled");
      return Ensure::Throttled;
    }

    let (pod, offload) = match self.build_pod(workflow, request) {
      Ok(built) => built,
      Err(message) => return Ensure::Failed(message),
    };
    if let Some(config_map) = offload {
      match self.config_maps.create(config_map).await {
        Ok(_) => {}
        Err(err) if err.is_already_exists() => {}
        Err(err) if err.is_transient() => {
          warn!(error = %err, "template config map create failed; deferring");
          return Ensure::Throttled;
        }
        Err(err) => return Ensure::Failed(format!("create template config map: {err}")),
      }
    }
    match self.pods.create(pod).await {
      Ok(created) => {
        info!(pod = %created.metadata.name, "pod created");
        Ensure::Created
      }
      Err(err) if err.is_already_exists() => Ensure::Exists,
      Err(err) if err.is_transient() => {
        warn!(error = %err, "pod create failed; deferring");
        Ensure::Throttled
      }
      Err(err) => Ensure::Failed(format!("create pod: {err}")),
    }
  }

  /// The pod for a request, plus the config map carrying its template when
  /// the payload is too large for the environment.
  pub fn build_pod(
    &self,
    workflow: &Workflow,
    request: &PodRequest,
  ) -> Result<(Pod, Option<ConfigMap>), String> {
    let ns = workflow.namespace();
    let payload = serde_json::to_string(&request.template).map_err(|e| format!("encode template: {e}"))?;
    let root = self.executor.agent_root.clone();

    let mut env = vec![
      EnvVar::new(env::POD_NAME, &request.pod_name),
      EnvVar::field(env::POD_UID, "metadata.uid"),
      EnvVar::new(env::WORKFLOW_NAME, workflow.name()),
      EnvVar::new(env::WORKFLOW_NAMESPACE, ns),
      EnvVar::new(env::WORKFLOW_UID, &workflow.metadata.uid),
      EnvVar::new(env::NODE_ID, &request.node_id),
      EnvVar::new(env::AGENT_ROOT, &root),
      EnvVar::new(
        env::PROGRESS_TICK,
        loom_config::duration::format_duration(self.executor.progress_tick),
      ),
      EnvVar::new(
        env::SIGNAL_POLL,
        loom_config::duration::format_duration(self.executor.signal_poll),
      ),
      EnvVar::new(
        env::TERMINATION_GRACE,
        loom_config::duration::format_duration(self.termination_grace),
      ),
      EnvVar::new(env::INCLUDE_SCRIPT_OUTPUT, request.include_script_output.to_string()),
    ];
    if let Some(deadline) = request.deadline {
      env.push(EnvVar::new(env::DEADLINE, deadline.to_rfc3339()));
    }
    if let Some(artifacts) = &self.executor.artifact_root {
      env.push(EnvVar::new(env::ARTIFACT_ROOT, artifacts));
    }

    let mut volumes = vec![Volume {
      name: AGENT_VOLUME.to_string(),
      empty_dir: true,
      config_map: None,
    }];
    let agent_mount = VolumeMount {
      name: AGENT_VOLUME.to_string(),
      mount_path: root.clone(),
    };
    let mut init_mounts = vec![agent_mount.clone()];

    let offload = if payload.len() > MAX_ENV_TEMPLATE_BYTES {
      env.push(EnvVar::new(env::TEMPLATE, OFFLOADED));
      env.push(EnvVar::new(env::TEMPLATE_MOUNT, TEMPLATE_MOUNT));
      volumes.push(Volume {
        name: TEMPLATE_VOLUME.to_string(),
        empty_dir: false,
        config_map: Some(ConfigMapVolume {
          name: request.pod_name.clone(),
        }),
      });
      init_mounts.push(VolumeMount {
        name: TEMPLATE_VOLUME.to_string(),
        mount_path: TEMPLATE_MOUNT.to_string(),
      });
      let mut config_map = ConfigMap {
        metadata: ObjectMeta::new(ns, &request.pod_name)
          .with_label(LABEL_WORKFLOW, workflow.name())
          .with_label(LABEL_WORKFLOW_NAMESPACE, ns),
        ..Default::default()
      };
      config_map.data.insert(OFFLOAD_KEY.to_string(), payload);
      Some(config_map)
    } else {
      env.push(EnvVar::new(env::TEMPLATE, payload));
      None
    };

    let agent = |name: &str, role: &str, mounts: Vec<VolumeMount>| Container {
      name: name.to_string(),
      image: self.executor.image.clone(),
      command: vec!["loom".to_string(), "executor".to_string(), role.to_string()],
      env: env.clone(),
      volume_mounts: mounts,
      ..Default::default()
    };
    let init = agent(INIT_CONTAINER, "init", init_mounts);
    let wait = agent(WAIT_CONTAINER, "wait", vec![agent_mount.clone()]);
    let main = self.main_container(request, &env, agent_mount)?;

    let pod = Pod {
      metadata: ObjectMeta::new(ns, &request.pod_name)
        .with_label(LABEL_WORKFLOW, workflow.name())
        .with_label(LABEL_WORKFLOW_NAMESPACE, ns)
        .with_label(LABEL_NODE_ID, &request.node_id)
        .with_label(LABEL_COMPLETED, "false")
        .with_annotation(ANNOTATION_NODE_ID, &request.node_id)
        .with_annotation(ANNOTATION_NODE_NAME, &request.node_name),
      spec: PodSpec {
        init_containers: vec![init],
        containers: vec![main, wait],
        volumes,
        restart_policy: Some("Never".to_string()),
        active_deadline_seconds: None,
        termination_grace_period_seconds: Some(self.termination_grace.as_secs()),
      },
      status: Default::default(),
    };
    Ok((pod, offload))
  }

  /// The user's container with its command handed to the emissary. Resource
  /// templates have no user container; their main container is the bare
  /// agent image and the kubelet runs the resource action.
  fn main_container(
    &self,
    request: &PodRequest,
    env: &[EnvVar],
    agent_mount: VolumeMount,
  ) -> Result<Container, String> {
    let template = &request.template;
    let shim = format!("{}/{}", self.executor.agent_root, files::AGENT_BINARY);
    let mut container = match template.main_container() {
      Some(user) => {
        let mut container = user.clone();
        let mut command = vec![shim, "executor".to_string(), "emissary".to_string()];
        // Scripts get their argv from the staged template.
        if template.script.is_none() {
          command.push("--".to_string());
          command.extend(user.command.iter().cloned());
          command.extend(user.args.iter().cloned());
        }
        container.command = command;
        container.args.clear();
        container
      }
      None if template.resource.is_some() => Container {
        image: self.executor.image.clone(),
        ..Default::default()
      },
      None => return Err(format!("template '{}' has nothing to run", template.name)),
    };
    container.name = MAIN_CONTAINER.to_string();
    let user_env = std::mem::take(&mut container.env);
    container.env = env.to_vec();
    container.env.extend(user_env);
    container.volume_mounts.push(agent_mount);
    Ok(container)
  }

  /// Ask the agent to stop, then mark the pod for deletion. Once the grace
  /// period has passed the pod gets SIGKILL and a forced delete.
  #[instrument(skip_all, fields(pod = %pod_name, %cause))]
  pub async fn kill(&self, namespace: &str, pod_name: &str, cause: KillCause) -> Result<(), ClusterError> {
    match self.signaler.signal(namespace, pod_name, SIGTERM).await {
      Ok(()) => {}
      Err(err) if err.is_not_found() => return Ok(()),
      Err(err) => warn!(error = %err, "failed to signal pod"),
    }
    let grace = self.termination_grace.as_secs();
    match self
      .pods
      .delete(namespace, pod_name, &DeleteParams::graceful(grace.max(1)))
      .await
    {
      Ok(()) => {}
      Err(err) if err.is_not_found() => return Ok(()),
      Err(err) => return Err(err),
    }
    info!(grace_seconds = grace, "pod termination requested");

    let pods = self.pods.clone();
    let signaler = self.signaler.clone();
    let (namespace, pod_name) = (namespace.to_string(), pod_name.to_string());
    let wait = self.termination_grace;
    tokio::spawn(async move {
      tokio::time::sleep(wait).await;
      if pods.get(&namespace, &pod_name).await.is_err() {
        return;
      }
      warn!(pod = %pod_name, "grace period elapsed; killing pod");
      if let Err(err) = signaler.signal(&namespace, &pod_name, SIGKILL).await {
        debug!(pod = %pod_name, error = %err, "failed to deliver SIGKILL");
      }
      match pods.delete(&namespace, &pod_name, &DeleteParams::immediate()).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => warn!(pod = %pod_name, error = %err, "forced delete failed"),
      }
    });
    Ok(())
  }

  /// Relabel a finished node's pod `completed=true`.
  pub async fn mark_completed(&self, namespace: &str, pod_name: &str) -> Result<(), ClusterError> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      let mut pod = match self.pods.get(namespace, pod_name).await {
        Ok(pod) => pod,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
      };
      if pod.metadata.label(LABEL_COMPLETED) == Some("true") {
        return Ok(());
      }
      pod
        .metadata
        .labels
        .insert(LABEL_COMPLETED.to_string(), "true".to_string());
      match self.pods.replace(pod).await {
        Ok(_) => return Ok(()),
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) if err.is_conflict() && attempt < RELABEL_ATTEMPTS => continue,
        Err(err) => return Err(err),
      }
    }
  }
}
