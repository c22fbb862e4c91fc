//! One reconcile of one workflow key.
//!
//! Reads the workflow and its pods and task results from the caches, runs the
//! operator, applies its actions and persists the resulting status with a
//! compare-and-swap replace. A conflict is not an error: a newer version of the
//! workflow is already on its way through the informer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use loom_cluster::{Pod, TaskResult};
use loom_config::WorkflowSpec;
use loom_operator::{Action, Outcome, Snapshot, Transition, operate, referenced_scopes};
use loom_workflow::contract::{LABEL_COMPLETED, LABEL_CONTROLLER_INSTANCE_ID};
use loom_workflow::{NodePhase, TemplateScope, Workflow, WorkflowStatus};

use crate::deps::Dependencies;
use crate::error::Result;
use crate::events::WorkflowEvent;
use crate::orchestrator::Ensure;

/// Retry after a throttled pod create.
const THROTTLED_RETRY: Duration = Duration::from_secs(1);
/// Retry after a failed kill or relabel.
const ACTION_RETRY: Duration = Duration::from_secs(2);

struct Memo {
  fingerprint: Vec<u8>,
  due: Option<DateTime<Utc>>,
}

pub struct Reconciler {
  deps: Arc<Dependencies>,
  memo: Mutex<HashMap<String, Memo>>,
}

impl Reconciler {
  pub fn new(deps: Arc<Dependencies>) -> Self {
    Self {
      deps,
      memo: Mutex::new(HashMap::new()),
    }
  }

  pub fn deps(&self) -> &Arc<Dependencies> {
    &self.deps
  }

  /// Reconcile `key` (`namespace/name`). Returns how long until the workflow
  /// must be looked at again regardless of cluster events.
  #[instrument(skip_all, fields(workflow = %key))]
  pub async fn reconcile(&self, key: &str) -> Result<Option<Duration>> {
    let Some(workflow) = self.deps.caches.workflows.get(key) else {
      self.memo.lock().remove(key);
      return Ok(None);
    };
    if workflow.metadata.is_deleting() || !self.manages(&workflow) {
      return Ok(None);
    }

    let pods = self.deps.caches.pods.owned_by(key);
    let results = self.deps.caches.results.owned_by(key);
    let now = Utc::now();
    let fingerprint = fingerprint(&workflow, &pods, &results);
    if self.unchanged(key, &fingerprint, now) {
      debug!("nothing changed since the last pass");
      return Ok(None);
    }

    let libraries = if workflow.status.stored_templates.is_empty() && !workflow.is_completed() {
      self.libraries(&workflow).await?
    } else {
      BTreeMap::new()
    };
    let limits = self
      .deps
      .config
      .limits(self.namespace_active(&workflow));
    let outcome = operate(&Snapshot {
      workflow: &workflow,
      pods: &pods,
      results: &results,
      libraries: &libraries,
      now,
      limits: &limits,
    });

    let Outcome {
      mut status,
      actions,
      mut requeue_after,
      mut transitions,
    } = outcome;
    let mut clean = true;
    for action in actions {
      let retry = self
        .apply(&workflow, &pods, action, &mut status, &mut transitions, now)
        .await;
      if let Some(retry) = retry {
        clean = false;
        requeue_after = Some(requeue_after.map_or(retry, |r| r.min(retry)));
      }
    }

    if status != workflow.status {
      let Some(updated) = self.persist(&workflow, status).await? else {
        return Ok(None);
      };
      for transition in &transitions {
        if let Some(event) = WorkflowEvent::from_transition(&updated, transition, now) {
          self.deps.recorder.record(event).await;
        }
      }
      if !workflow.is_completed() && updated.is_completed() {
        info!(phase = updated.status.phase.as_str(), "workflow completed");
        self.archive(&updated, now).await;
      }
    }

    if clean {
      let due = requeue_after
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| now + d);
      self.memo.lock().insert(key.to_string(), Memo { fingerprint, due });
    } else {
      self.memo.lock().remove(key);
    }
    Ok(requeue_after)
  }

  /// Drop what is remembered about `key` so the next pass runs in full.
  pub fn forget(&self, key: &str) {
    self.memo.lock().remove(key);
  }

  fn manages(&self, workflow: &Workflow) -> bool {
    workflow.metadata.label(LABEL_CONTROLLER_INSTANCE_ID) == self.deps.config.instance_id.as_deref()
  }

  fn unchanged(&self, key: &str, fingerprint: &[u8], now: DateTime<Utc>) -> bool {
    let memo = self.memo.lock();
    memo
      .get(key)
      .is_some_and(|m| m.fingerprint == fingerprint && m.due.is_none_or(|due| now < due))
  }

  /// Live leaves of other workflows in the same namespace.
  fn namespace_active(&self, workflow: &Workflow) -> usize {
    if self.deps.config.namespace_parallelism.is_none() {
      return 0;
    }
    let own = workflow.key();
    self
      .deps
      .caches
      .pods
      .list()
      .iter()
      .filter(|p| p.metadata.namespace == workflow.namespace())
      .filter(|p| p.metadata.label(LABEL_COMPLETED) == Some("false"))
      .filter(|p| !p.status.phase.is_terminal())
      .filter(|p| crate::informer::workflow_owner(&p.metadata).as_deref() != Some(own.as_str()))
      .count()
  }

  /// Fetch the transitive closure of templates the workflow references. A
  /// missing library is left out; initialisation reports it.
  async fn libraries(&self, workflow: &Workflow) -> Result<BTreeMap<TemplateScope, WorkflowSpec>> {
    let cluster = &self.deps.cluster;
    let mut found = BTreeMap::new();
    let mut pending: Vec<TemplateScope> = referenced_scopes(&workflow.spec).into_iter().collect();
    while let Some(scope) = pending.pop() {
      if found.contains_key(&scope) {
        continue;
      }
      let fetched = match &scope {
        TemplateScope::Local => continue,
        TemplateScope::Namespaced(name) => cluster
          .workflow_templates
          .get(workflow.namespace(), name)
          .await
          .map(|t| t.spec),
        TemplateScope::Cluster(name) => cluster
          .cluster_workflow_templates
          .get("", name)
          .await
          .map(|t| t.spec),
      };
      match fetched {
        Ok(spec) => {
          pending.extend(referenced_scopes(&spec));
          found.insert(scope, spec);
        }
        Err(err) if err.is_not_found() => debug!(?scope, "referenced template not found"),
        Err(err) => return Err(err.into()),
      }
    }
    Ok(found)
  }

  /// Apply one action. Returns a retry delay when it could not be completed.
  async fn apply(
    &self,
    workflow: &Workflow,
    pods: &[Pod],
    action: Action,
    status: &mut WorkflowStatus,
    transitions: &mut Vec<Transition>,
    now: DateTime<Utc>,
  ) -> Option<Duration> {
    let orchestrator = &self.deps.orchestrator;
    match action {
      Action::CreatePod(request) => match orchestrator.ensure_running(workflow, &request, pods).await {
        Ensure::Created | Ensure::Exists => None,
        Ensure::Throttled => {
          if let Some(node) = status.nodes.get_mut(&request.node_id) {
            node.pod_name = None;
            node.started_at = None;
          }
          Some(THROTTLED_RETRY)
        }
        Ensure::Failed(message) => {
          warn!(node = %request.node_name, %message, "pod could not be created");
          if let Some(node) = status.nodes.get_mut(&request.node_id)
            && node.finish(NodePhase::Error, Some(message.clone()), now)
          {
            transitions.push(Transition::Node {
              id: node.id.clone(),
              name: node.name.clone(),
              phase: NodePhase::Error,
              message: Some(message),
            });
          }
          Some(Duration::ZERO)
        }
      },
      Action::KillPod {
        node_id,
        pod_name,
        cause,
      } => match orchestrator.kill(workflow.namespace(), &pod_name, cause).await {
        Ok(()) => None,
        Err(err) => {
          warn!(pod = %pod_name, %cause, error = %err, "kill failed");
          // Without the marker the operator asks for the kill again.
          if let Some(node) = status.nodes.get_mut(&node_id)
            && node.message.as_deref() == Some(cause.as_str())
          {
            node.message = None;
          }
          Some(ACTION_RETRY)
        }
      },
      Action::MarkCompleted { pod_name } => {
        match orchestrator.mark_completed(workflow.namespace(), &pod_name).await {
          Ok(()) => None,
          Err(err) => {
            warn!(pod = %pod_name, error = %err, "relabel failed");
            Some(ACTION_RETRY)
          }
        }
      }
    }
  }

  /// Compare-and-swap the new status. `None` when the write lost a race or
  /// the workflow is gone.
  async fn persist(&self, workflow: &Workflow, status: WorkflowStatus) -> Result<Option<Workflow>> {
    let mut next = workflow.clone();
    next.status = status;
    match self.deps.cluster.workflows.replace(next).await {
      Ok(updated) => Ok(Some(updated)),
      Err(err) if err.is_conflict() => {
        debug!("status write conflicted; waiting for the newer version");
        Ok(None)
      }
      Err(err) if err.is_not_found() => Ok(None),
      Err(err) => Err(err.into()),
    }
  }

  async fn archive(&self, workflow: &Workflow, now: DateTime<Utc>) {
    let Some(archive) = &self.deps.archive else {
      return;
    };
    if let Err(err) = archive.archive(workflow, now).await {
      warn!(error = %err, "failed to archive workflow");
    }
  }
}

/// Identifies the inputs of a pass: every write bumps a resource version.
fn fingerprint(workflow: &Workflow, pods: &[Pod], results: &[TaskResult]) -> Vec<u8> {
  let mut hasher = Sha256::new();
  hasher.update(workflow.metadata.uid.as_bytes());
  hasher.update(workflow.metadata.resource_version.to_be_bytes());
  for pod in pods {
    hasher.update(pod.metadata.name.as_bytes());
    hasher.update(pod.metadata.resource_version.to_be_bytes());
  }
  hasher.update(b"/");
  for result in results {
    hasher.update(result.metadata.name.as_bytes());
    hasher.update(result.metadata.resource_version.to_be_bytes());
  }
  hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
  use loom_cluster::{Api, ClusterError, Operation};
  use loom_workflow::contract::LABEL_NODE_ID;

  use super::*;
  use crate::config::ControllerConfig;
  use crate::deps::testing::{Fixture, fixture};
  use crate::events::Reason;

  const HELLO: &str = r#"
entrypoint: hello
templates:
  - name: hello
    container:
      image: alpine
      command: [echo, hello]
"#;

  async fn submit(f: &Fixture, manifest: &str) -> Workflow {
    let spec: WorkflowSpec = serde_yaml::from_str(manifest).unwrap();
    let created = f
      .cluster
      .workflows
      .create(Workflow::new("default", "hello", spec))
      .await
      .unwrap();
    f.deps.caches.workflows.upsert(created.clone());
    created
  }

  /// Copy the store's current workflow and pods into the caches.
  async fn sync(f: &Fixture) {
    let wf = f.cluster.workflows.get("default", "hello").await.unwrap();
    f.deps.caches.workflows.upsert(wf);
    for pod in f.cluster.pods.snapshot() {
      f.deps.caches.pods.upsert(pod);
    }
  }

  #[tokio::test]
  async fn test_first_pass_creates_pod_and_persists() {
    let mut f = fixture(ControllerConfig::default());
    submit(&f, HELLO).await;
    let reconciler = Reconciler::new(f.deps.clone());

    reconciler.reconcile("default/hello").await.unwrap();

    let pods = f.cluster.pods.snapshot();
    assert_eq!(pods.len(), 1);
    let stored = f.cluster.workflows.get("default", "hello").await.unwrap();
    assert_eq!(stored.status.phase, loom_workflow::WorkflowPhase::Running);
    let node = stored.status.nodes.by_name("hello").unwrap();
    assert_eq!(pods[0].metadata.label(LABEL_NODE_ID), Some(node.id.as_str()));
    assert_eq!(f.events.recv().await.unwrap().reason, Reason::WorkflowRunning);
  }

  #[tokio::test]
  async fn test_second_pass_is_a_no_op() {
    let f = fixture(ControllerConfig::default());
    submit(&f, HELLO).await;
    let reconciler = Reconciler::new(f.deps.clone());
    reconciler.reconcile("default/hello").await.unwrap();
    sync(&f).await;
    let before = f.cluster.workflows.get("default", "hello").await.unwrap();

    reconciler.reconcile("default/hello").await.unwrap();
    reconciler.reconcile("default/hello").await.unwrap();

    let after = f.cluster.workflows.get("default", "hello").await.unwrap();
    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
    assert_eq!(f.cluster.pods.snapshot().len(), 1);
  }

  #[tokio::test]
  async fn test_conflicting_write_is_dropped_quietly() {
    let f = fixture(ControllerConfig::default());
    let submitted = submit(&f, HELLO).await;
    let mut newer = submitted.clone();
    newer.metadata.labels.insert("touched".into(), "yes".into());
    f.cluster.workflows.replace(newer).await.unwrap();
    let reconciler = Reconciler::new(f.deps.clone());

    let requeue = reconciler.reconcile("default/hello").await.unwrap();

    assert_eq!(requeue, None);
    let stored = f.cluster.workflows.get("default", "hello").await.unwrap();
    assert!(stored.status.nodes.is_empty());
  }

  #[tokio::test]
  async fn test_other_instance_is_ignored() {
    let f = fixture(ControllerConfig {
      instance_id: Some("blue".into()),
      ..Default::default()
    });
    submit(&f, HELLO).await;
    let reconciler = Reconciler::new(f.deps.clone());

    reconciler.reconcile("default/hello").await.unwrap();

    assert!(f.cluster.pods.snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_unavailable_create_is_retried() {
    let f = fixture(ControllerConfig::default());
    submit(&f, HELLO).await;
    f.cluster
      .pods
      .fail_next(Operation::Create, ClusterError::Unavailable("down".into()));
    let reconciler = Reconciler::new(f.deps.clone());

    let requeue = reconciler.reconcile("default/hello").await.unwrap();

    assert_eq!(requeue, Some(THROTTLED_RETRY));
    assert!(f.cluster.pods.snapshot().is_empty());
    let stored = f.cluster.workflows.get("default", "hello").await.unwrap();
    let node = stored.status.nodes.by_name("hello").unwrap();
    assert!(node.pod_name.is_none());

    sync(&f).await;
    reconciler.reconcile("default/hello").await.unwrap();
    assert_eq!(f.cluster.pods.snapshot().len(), 1);
  }

  #[tokio::test]
  async fn test_missing_library_errors_workflow() {
    let f = fixture(ControllerConfig::default());
    submit(
      &f,
      r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - name: call
          templateRef:
            name: shared
            template: hello
"#,
    )
    .await;
    let reconciler = Reconciler::new(f.deps.clone());

    reconciler.reconcile("default/hello").await.unwrap();

    let stored = f.cluster.workflows.get("default", "hello").await.unwrap();
    assert_eq!(stored.status.phase, loom_workflow::WorkflowPhase::Error);
    assert!(f.cluster.pods.snapshot().is_empty());
  }
}
