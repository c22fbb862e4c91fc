//! Time-based cleanup: workflow TTLs, pod garbage collection, the retention
//! policy, idle workflow groups and archive expiry.
//!
//! A single loop ticks every `gc_interval`. Each tick reads candidates from the
//! informer caches and runs the resulting deletes with bounded concurrency.
//! Every delete tolerates the object already being gone.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use loom_cluster::{ClusterError, DeleteParams, LabelSelector, ListParams, Pod, PodPhase};
use loom_config::{PodGcStrategy, WorkflowSpec};
use loom_workflow::contract::{LABEL_COMPLETED, LABEL_GROUP, LABEL_WORKFLOW, MAIN_CONTAINER, WAIT_CONTAINER};
use loom_workflow::{GroupPhase, Workflow, WorkflowGroup, WorkflowPhase};

use crate::deps::Dependencies;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Task {
  /// Delete a workflow along with its pods, task results and config maps.
  DeleteWorkflow {
    namespace: String,
    name: String,
    reason: &'static str,
  },
  /// Batch delete the completed pods of a workflow.
  DeleteCompletedPods { namespace: String, workflow: String },
  DeletePod { namespace: String, name: String },
  TouchGroup { namespace: String, name: String },
  TerminateGroup {
    namespace: String,
    name: String,
    idle_seconds: i64,
  },
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sweep {
  pub workflows_deleted: usize,
  pub pods_deleted: usize,
  pub groups_terminated: usize,
  pub archived_expired: u64,
}

pub struct Retention {
  deps: Arc<Dependencies>,
}

impl Retention {
  pub fn new(deps: Arc<Dependencies>) -> Self {
    Self { deps }
  }

  pub async fn run(self, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(self.deps.config.gc_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = interval.tick() => {}
      }
      let sweep = self.tick(Utc::now()).await;
      if sweep != Sweep::default() {
        debug!(?sweep, "retention tick");
      }
    }
  }

  #[instrument(skip_all)]
  pub async fn tick(&self, now: DateTime<Utc>) -> Sweep {
    let workflows = self.deps.caches.workflows.list();
    let mut tasks = BTreeSet::new();
    for workflow in workflows.iter().filter(|w| !w.metadata.is_deleting()) {
      if let Some(task) = self.ttl(workflow, now) {
        tasks.insert(task);
      }
      tasks.extend(self.pod_gc(workflow, now));
    }
    tasks.extend(self.over_retention(&workflows));
    tasks.extend(self.groups(&workflows, now));

    // A workflow being deleted takes its pods with it.
    let doomed: BTreeSet<(String, String)> = tasks
      .iter()
      .filter_map(|t| match t {
        Task::DeleteWorkflow { namespace, name, .. } => Some((namespace.clone(), name.clone())),
        _ => None,
      })
      .collect();
    tasks.retain(|t| match t {
      Task::DeleteCompletedPods { namespace, workflow } => {
        !doomed.contains(&(namespace.clone(), workflow.clone()))
      }
      _ => true,
    });

    let mut sweep = Sweep::default();
    let outcomes: Vec<(Task, Result<usize, ClusterError>)> = futures::stream::iter(tasks)
      .map(|task| async move {
        let result = self.execute(&task, now).await;
        (task, result)
      })
      .buffer_unordered(self.deps.config.gc_workers.max(1))
      .collect()
      .await;
    for (task, result) in outcomes {
      match (task, result) {
        (Task::DeleteWorkflow { .. }, Ok(n)) => sweep.workflows_deleted += n,
        (Task::DeleteCompletedPods { .. } | Task::DeletePod { .. }, Ok(n)) => sweep.pods_deleted += n,
        (Task::TerminateGroup { .. }, Ok(n)) => sweep.groups_terminated += n,
        (Task::TouchGroup { .. }, Ok(_)) => {}
        (task, Err(err)) => warn!(?task, error = %err, "cleanup failed; retrying next tick"),
      }
    }
    sweep.archived_expired = self.expire_archive(now).await;
    sweep
  }

  fn ttl(&self, workflow: &Workflow, now: DateTime<Utc>) -> Option<Task> {
    if !workflow.is_completed() {
      return None;
    }
    let finished = workflow.status.finished_at?;
    let succeeded = workflow.status.phase == WorkflowPhase::Succeeded;
    let seconds = effective_spec(workflow)
      .ttl_strategy
      .as_ref()?
      .seconds_for(succeeded)?;
    let expires = after(finished, seconds)?;
    (now >= expires).then(|| Task::DeleteWorkflow {
      namespace: workflow.namespace().to_string(),
      name: workflow.name().to_string(),
      reason: "ttl expired",
    })
  }

  fn pod_gc(&self, workflow: &Workflow, now: DateTime<Utc>) -> Vec<Task> {
    let strategy = effective_spec(workflow)
      .pod_gc
      .as_ref()
      .map(|gc| gc.strategy)
      .unwrap_or_default();
    let delay = chrono::Duration::from_std(self.deps.config.pod_gc_delete_delay)
      .unwrap_or_else(|_| chrono::Duration::zero());
    let pods: Vec<Pod> = self
      .deps
      .caches
      .pods
      .owned_by(&workflow.key())
      .into_iter()
      .filter(|p| !p.metadata.is_deleting())
      .filter(|p| p.metadata.label(LABEL_COMPLETED) == Some("true"))
      .collect();
    if pods.is_empty() {
      return Vec::new();
    }
    let batch = || {
      vec![Task::DeleteCompletedPods {
        namespace: workflow.namespace().to_string(),
        workflow: workflow.name().to_string(),
      }]
    };
    let workflow_gate = |success_only: bool| {
      let open = workflow.is_completed()
        && (!success_only || workflow.status.phase == WorkflowPhase::Succeeded)
        && workflow.status.finished_at.is_some_and(|at| reached(now, at, delay));
      if open { batch() } else { Vec::new() }
    };
    let due = |pod: &Pod| pod_finished(pod).is_none_or(|at| reached(now, at, delay));

    match strategy {
      PodGcStrategy::Never => Vec::new(),
      PodGcStrategy::OnWorkflowCompletion => workflow_gate(false),
      PodGcStrategy::OnWorkflowSuccess => workflow_gate(true),
      PodGcStrategy::OnPodCompletion if delay.is_zero() => batch(),
      PodGcStrategy::OnPodCompletion => pods
        .iter()
        .filter(|p| due(p))
        .map(|p| Task::DeletePod {
          namespace: p.metadata.namespace.clone(),
          name: p.metadata.name.clone(),
        })
        .collect(),
      PodGcStrategy::OnPodSuccess => pods
        .iter()
        .filter(|p| p.status.phase == PodPhase::Succeeded && due(p))
        .map(|p| Task::DeletePod {
          namespace: p.metadata.namespace.clone(),
          name: p.metadata.name.clone(),
        })
        .collect(),
    }
  }

  /// Workflows beyond the per-namespace, per-phase retention budget, oldest
  /// first.
  fn over_retention(&self, workflows: &[Workflow]) -> Vec<Task> {
    let Some(policy) = &self.deps.config.retention_policy else {
      return Vec::new();
    };
    let mut buckets: HashMap<(&str, WorkflowPhase), Vec<&Workflow>> = HashMap::new();
    for workflow in workflows.iter().filter(|w| w.is_completed() && !w.metadata.is_deleting()) {
      buckets
        .entry((workflow.namespace(), workflow.status.phase))
        .or_default()
        .push(workflow);
    }
    let mut tasks = Vec::new();
    for ((_, phase), mut bucket) in buckets {
      let keep = match phase {
        WorkflowPhase::Succeeded => policy.completed,
        WorkflowPhase::Failed => policy.failed,
        WorkflowPhase::Error => policy.errored,
        _ => None,
      };
      let Some(keep) = keep else { continue };
      if bucket.len() <= keep {
        continue;
      }
      bucket.sort_by(|a, b| {
        b.status
          .finished_at
          .cmp(&a.status.finished_at)
          .then_with(|| a.name().cmp(b.name()))
      });
      tasks.extend(bucket.into_iter().skip(keep).map(|w| Task::DeleteWorkflow {
        namespace: w.namespace().to_string(),
        name: w.name().to_string(),
        reason: "retention policy",
      }));
    }
    tasks
  }

  fn groups(&self, workflows: &[Workflow], now: DateTime<Utc>) -> Vec<Task> {
    let mut tasks = Vec::new();
    for group in self.deps.caches.groups.list() {
      if group.status.phase != GroupPhase::Active || group.metadata.is_deleting() {
        continue;
      }
      let (namespace, name) = (group.metadata.namespace.clone(), group.metadata.name.clone());
      let active = workflows.iter().any(|w| {
        w.namespace() == namespace
          && w.metadata.label(LABEL_GROUP) == Some(name.as_str())
          && !w.is_completed()
      });
      let last_active = group.status.last_active_at;
      if active {
        let stale = last_active.is_none_or(|at| {
          chrono::Duration::from_std(self.deps.config.gc_interval)
            .is_ok_and(|interval| now - at >= interval)
        });
        if stale {
          tasks.push(Task::TouchGroup { namespace, name });
        }
        continue;
      }
      let Some(since) = last_active.or(group.metadata.creation_timestamp) else {
        tasks.push(Task::TouchGroup { namespace, name });
        continue;
      };
      let idle = now - since;
      let timeout = i64::try_from(group.spec.idle_timeout_seconds).unwrap_or(i64::MAX);
      if group.spec.idle_timeout_seconds > 0 && idle.num_seconds() >= timeout {
        tasks.push(Task::TerminateGroup {
          namespace,
          name,
          idle_seconds: idle.num_seconds(),
        });
      }
    }
    tasks
  }

  async fn execute(&self, task: &Task, now: DateTime<Utc>) -> Result<usize, ClusterError> {
    let cluster = &self.deps.cluster;
    let pod_delete = DeleteParams::graceful(self.deps.config.pod_gc_grace.as_secs());
    match task {
      Task::DeleteWorkflow { namespace, name, reason } => {
        let deleted = ignore_missing(
          cluster
            .workflows
            .delete(namespace, name, &DeleteParams::immediate())
            .await,
        )?;
        let owned = ListParams::namespaced(namespace.clone())
          .with_selector(LabelSelector::new().equals(LABEL_WORKFLOW, name.clone()));
        cluster.pods.delete_collection(&owned, &pod_delete).await?;
        cluster
          .task_results
          .delete_collection(&owned, &DeleteParams::immediate())
          .await?;
        cluster
          .config_maps
          .delete_collection(&owned, &DeleteParams::immediate())
          .await?;
        if deleted {
          info!(workflow = %format!("{namespace}/{name}"), reason, "workflow deleted");
        }
        Ok(usize::from(deleted))
      }
      Task::DeleteCompletedPods { namespace, workflow } => {
        let selector = LabelSelector::new()
          .equals(LABEL_WORKFLOW, workflow.clone())
          .equals(LABEL_COMPLETED, "true");
        let params = ListParams::namespaced(namespace.clone()).with_selector(selector);
        let count = cluster.pods.delete_collection(&params, &pod_delete).await?;
        debug!(workflow = %format!("{namespace}/{workflow}"), count, "completed pods deleted");
        Ok(count)
      }
      Task::DeletePod { namespace, name } => {
        ignore_missing(cluster.pods.delete(namespace, name, &pod_delete).await).map(usize::from)
      }
      Task::TouchGroup { namespace, name } => {
        self
          .update_group(namespace, name, |group| {
            group.status.last_active_at = Some(now);
          })
          .await
      }
      Task::TerminateGroup {
        namespace,
        name,
        idle_seconds,
      } => {
        let count = self
          .update_group(namespace, name, |group| {
            group.status.phase = GroupPhase::Terminating;
            group.status.message = Some(format!("idle for {idle_seconds}s"));
          })
          .await?;
        if count > 0 {
          info!(group = %format!("{namespace}/{name}"), idle_seconds, "workflow group terminating");
        }
        Ok(count)
      }
    }
  }

  /// Read-modify-write a group. A lost race or a vanished group counts as no
  /// change; the next tick sees the newer state.
  async fn update_group(
    &self,
    namespace: &str,
    name: &str,
    change: impl FnOnce(&mut WorkflowGroup),
  ) -> Result<usize, ClusterError> {
    let mut group = match self.deps.cluster.groups.get(namespace, name).await {
      Ok(group) => group,
      Err(err) if err.is_not_found() => return Ok(0),
      Err(err) => return Err(err),
    };
    change(&mut group);
    match self.deps.cluster.groups.replace(group).await {
      Ok(_) => Ok(1),
      Err(err) if err.is_conflict() || err.is_not_found() => Ok(0),
      Err(err) => Err(err),
    }
  }

  async fn expire_archive(&self, now: DateTime<Utc>) -> u64 {
    let (Some(archive), Some(ttl)) = (
      &self.deps.archive,
      self.deps.config.archive.as_ref().and_then(|a| a.ttl),
    ) else {
      return 0;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
      return 0;
    };
    match archive.expire(now - ttl).await {
      Ok(count) => count,
      Err(err) => {
        warn!(error = %err, "archive expiry failed");
        0
      }
    }
  }
}

/// The spec frozen at initialisation, falling back to the live one.
fn effective_spec(workflow: &Workflow) -> &WorkflowSpec {
  workflow
    .status
    .stored_workflow_spec
    .as_deref()
    .unwrap_or(&workflow.spec)
}

/// `start + secs`; `None` past the end of representable time.
fn after(start: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
  let delta = chrono::Duration::try_seconds(i64::try_from(secs).ok()?)?;
  start.checked_add_signed(delta)
}

fn reached(now: DateTime<Utc>, start: DateTime<Utc>, delay: chrono::Duration) -> bool {
  start.checked_add_signed(delay).is_some_and(|at| now >= at)
}

fn pod_finished(pod: &Pod) -> Option<DateTime<Utc>> {
  pod
    .finished_at(WAIT_CONTAINER)
    .max(pod.finished_at(MAIN_CONTAINER))
}

/// `Ok(false)` when the object was already gone.
fn ignore_missing(result: Result<(), ClusterError>) -> Result<bool, ClusterError> {
  match result {
    Ok(()) => Ok(true),
    Err(err) if err.is_not_found() => Ok(false),
    Err(err) => Err(err),
  }
}
