use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use loom_workflow::{ClusterWorkflowTemplate, Workflow, WorkflowGroup, WorkflowTemplate};

use crate::api::{Api, DeleteParams, ListParams, ObjectList, WatchEvent, WatchStream};
use crate::cluster::Cluster;
use crate::error::{ClusterError, Result};
use crate::objects::{ConfigMap, DynamicObject, Event, TaskResult};
use crate::pod::Pod;
use crate::resource::Resource;

const DEFAULT_HISTORY: usize = 4096;
const DEFAULT_GRACE_SECONDS: u64 = 30;

/// Calls a test can make fail with [`MemoryApi::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Get,
  List,
  Create,
  Replace,
  Delete,
  Watch,
}

struct State<K> {
  objects: BTreeMap<(String, String), K>,
  history: VecDeque<(u64, WatchEvent<K>)>,
  /// Highest resource version dropped from `history`.
  compacted: u64,
  failures: HashMap<Operation, VecDeque<ClusterError>>,
}

/// In-memory store for one kind, with a bounded event history so watches can
/// resume from a marker.
pub struct MemoryApi<K: Resource> {
  state: Mutex<State<K>>,
  versions: Arc<AtomicU64>,
  events: broadcast::Sender<(u64, WatchEvent<K>)>,
  history_limit: usize,
}

impl<K: Resource> MemoryApi<K> {
  pub fn new(versions: Arc<AtomicU64>) -> Self {
    Self::with_history(versions, DEFAULT_HISTORY)
  }

  pub fn with_history(versions: Arc<AtomicU64>, history_limit: usize) -> Self {
    let (events, _) = broadcast::channel(history_limit.max(16));
    Self {
      state: Mutex::new(State {
        objects: BTreeMap::new(),
        history: VecDeque::new(),
        compacted: 0,
        failures: HashMap::new(),
      }),
      versions,
      events,
      history_limit,
    }
  }

  /// Make the next call of `operation` fail with `error`.
  pub fn fail_next(&self, operation: Operation, error: ClusterError) {
    self
      .state
      .lock()
      .failures
      .entry(operation)
      .or_default()
      .push_back(error);
  }

  /// Drop all retained history; watches from older markers get `Gone`.
  pub fn compact(&self) {
    let mut state = self.state.lock();
    if let Some((rv, _)) = state.history.back() {
      state.compacted = *rv;
    }
    state.history.clear();
  }

  /// Current objects, for assertions.
  pub fn snapshot(&self) -> Vec<K> {
    self.state.lock().objects.values().cloned().collect()
  }

  fn next_version(&self) -> u64 {
    self.versions.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn injected(&self, state: &mut State<K>, operation: Operation) -> Result<()> {
    match state
      .failures
      .get_mut(&operation)
      .and_then(VecDeque::pop_front)
    {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn record(&self, state: &mut State<K>, rv: u64, event: WatchEvent<K>) {
    state.history.push_back((rv, event.clone()));
    while state.history.len() > self.history_limit {
      if let Some((dropped, _)) = state.history.pop_front() {
        state.compacted = dropped;
      }
    }
    // No receivers is fine.
    let _ = self.events.send((rv, event));
  }

  fn key_of(object: &K) -> (String, String) {
    let meta = object.meta();
    (meta.namespace.clone(), meta.name.clone())
  }

  fn describe(key: &(String, String)) -> String {
    format!("{}/{}", key.0, key.1)
  }

  fn delete_locked(
    &self,
    state: &mut State<K>,
    key: &(String, String),
    params: &DeleteParams,
  ) -> Result<()> {
    let Some(existing) = state.objects.get(key).cloned() else {
      return Err(ClusterError::NotFound {
        kind: K::KIND,
        key: Self::describe(key),
      });
    };

    let rv = self.next_version();
    let graceful = K::GRACEFUL_DELETE && params.grace_period_seconds != Some(0);
    if graceful {
      if existing.meta().is_deleting() {
        return Ok(());
      }
      let mut marked = existing;
      let meta = marked.meta_mut();
      meta.deletion_timestamp = Some(Utc::now());
      meta.deletion_grace_period_seconds =
        Some(params.grace_period_seconds.unwrap_or(DEFAULT_GRACE_SECONDS));
      meta.resource_version = rv;
      state.objects.insert(key.clone(), marked.clone());
      self.record(state, rv, WatchEvent::Modified(marked));
    } else {
      let mut removed = existing;
      removed.meta_mut().resource_version = rv;
      state.objects.remove(key);
      self.record(state, rv, WatchEvent::Deleted(removed));
    }
    Ok(())
  }
}

#[async_trait]
impl<K: Resource> Api<K> for MemoryApi<K> {
  async fn get(&self, namespace: &str, name: &str) -> Result<K> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Get)?;
    let key = (namespace.to_string(), name.to_string());
    state
      .objects
      .get(&key)
      .cloned()
      .ok_or_else(|| ClusterError::NotFound {
        kind: K::KIND,
        key: Self::describe(&key),
      })
  }

  async fn list(&self, params: &ListParams) -> Result<ObjectList<K>> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::List)?;
    let items = state
      .objects
      .values()
      .filter(|o| params.matches(o.meta()))
      .cloned()
      .collect();
    Ok(ObjectList {
      items,
      resource_version: self.versions.load(Ordering::SeqCst),
    })
  }

  async fn create(&self, mut object: K) -> Result<K> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Create)?;
    if object.meta().name.is_empty() {
      return Err(ClusterError::Invalid(format!("{} without a name", K::KIND)));
    }
    let key = Self::key_of(&object);
    if state.objects.contains_key(&key) {
      return Err(ClusterError::AlreadyExists {
        kind: K::KIND,
        key: Self::describe(&key),
      });
    }

    let rv = self.next_version();
    let meta = object.meta_mut();
    if meta.uid.is_empty() {
      meta.uid = uuid::Uuid::new_v4().to_string();
    }
    meta.creation_timestamp.get_or_insert_with(Utc::now);
    meta.resource_version = rv;
    object.admit();

    state.objects.insert(key, object.clone());
    self.record(&mut state, rv, WatchEvent::Added(object.clone()));
    Ok(object)
  }

  async fn replace(&self, mut object: K) -> Result<K> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Replace)?;
    let key = Self::key_of(&object);
    let Some(existing) = state.objects.get(&key) else {
      return Err(ClusterError::NotFound {
        kind: K::KIND,
        key: Self::describe(&key),
      });
    };

    let actual = existing.meta().resource_version;
    let expected = object.meta().resource_version;
    if actual != expected {
      return Err(ClusterError::Conflict {
        kind: K::KIND,
        key: Self::describe(&key),
        expected,
        actual,
      });
    }

    let uid = existing.meta().uid.clone();
    let created = existing.meta().creation_timestamp;
    let deleting = existing.meta().deletion_timestamp;
    let grace = existing.meta().deletion_grace_period_seconds;

    let rv = self.next_version();
    let meta = object.meta_mut();
    meta.uid = uid;
    meta.creation_timestamp = created;
    if meta.deletion_timestamp.is_none() {
      meta.deletion_timestamp = deleting;
      meta.deletion_grace_period_seconds = grace;
    }
    meta.resource_version = rv;

    state.objects.insert(key, object.clone());
    self.record(&mut state, rv, WatchEvent::Modified(object.clone()));
    Ok(object)
  }

  async fn delete(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Delete)?;
    let key = (namespace.to_string(), name.to_string());
    self.delete_locked(&mut state, &key, params)
  }

  async fn delete_collection(&self, params: &ListParams, delete: &DeleteParams) -> Result<usize> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Delete)?;
    let keys: Vec<(String, String)> = state
      .objects
      .iter()
      .filter(|(_, o)| params.matches(o.meta()))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &keys {
      self.delete_locked(&mut state, key, delete)?;
    }
    Ok(keys.len())
  }

  async fn watch(&self, params: &ListParams, resource_version: u64) -> Result<WatchStream<K>> {
    let mut state = self.state.lock();
    self.injected(&mut state, Operation::Watch)?;
    if resource_version < state.compacted {
      return Err(ClusterError::Gone(resource_version));
    }

    let backlog: Vec<Result<WatchEvent<K>>> = state
      .history
      .iter()
      .filter(|(rv, e)| *rv > resource_version && params.matches(e.object().meta()))
      .map(|(_, e)| Ok(e.clone()))
      .collect();
    let receiver = self.events.subscribe();
    drop(state);

    debug!(kind = K::KIND, from = resource_version, backlog = backlog.len(), "watch opened");

    let params = params.clone();
    let live = futures::stream::unfold(Some(receiver), move |receiver| {
      let params = params.clone();
      async move {
        let mut receiver = receiver?;
        loop {
          match receiver.recv().await {
            Ok((rv, event)) => {
              if rv <= resource_version || !params.matches(event.object().meta()) {
                continue;
              }
              return Some((Ok(event), Some(receiver)));
            }
            Err(RecvError::Lagged(_)) => {
              return Some((Err(ClusterError::Gone(resource_version)), None));
            }
            Err(RecvError::Closed) => return None,
          }
        }
      }
    });

    Ok(futures::stream::iter(backlog).chain(live).boxed())
  }
}

/// Every kind loom uses, in memory, sharing one resource-version counter.
pub struct MemoryCluster {
  pub workflows: Arc<MemoryApi<Workflow>>,
  pub workflow_templates: Arc<MemoryApi<WorkflowTemplate>>,
  pub cluster_workflow_templates: Arc<MemoryApi<ClusterWorkflowTemplate>>,
  pub groups: Arc<MemoryApi<WorkflowGroup>>,
  pub pods: Arc<MemoryApi<Pod>>,
  pub task_results: Arc<MemoryApi<TaskResult>>,
  pub events: Arc<MemoryApi<Event>>,
  pub config_maps: Arc<MemoryApi<ConfigMap>>,
  pub objects: Arc<MemoryApi<DynamicObject>>,
}

impl MemoryCluster {
  pub fn new() -> Self {
    let versions = Arc::new(AtomicU64::new(0));
    Self {
      workflows: Arc::new(MemoryApi::new(versions.clone())),
      workflow_templates: Arc::new(MemoryApi::new(versions.clone())),
      cluster_workflow_templates: Arc::new(MemoryApi::new(versions.clone())),
      groups: Arc::new(MemoryApi::new(versions.clone())),
      pods: Arc::new(MemoryApi::new(versions.clone())),
      task_results: Arc::new(MemoryApi::new(versions.clone())),
      events: Arc::new(MemoryApi::new(versions.clone())),
      config_maps: Arc::new(MemoryApi::new(versions.clone())),
      objects: Arc::new(MemoryApi::new(versions)),
    }
  }

  /// The same stores behind the `Api` trait objects the controller takes.
  pub fn cluster(&self) -> Cluster {
    Cluster {
      workflows: self.workflows.clone(),
      workflow_templates: self.workflow_templates.clone(),
      cluster_workflow_templates: self.cluster_workflow_templates.clone(),
      groups: self.groups.clone(),
      pods: self.pods.clone(),
      task_results: self.task_results.clone(),
      events: self.events.clone(),
      config_maps: self.config_maps.clone(),
      objects: self.objects.clone(),
    }
  }
}

impl Default for MemoryCluster {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::selector::LabelSelector;
  use loom_config::ObjectMeta;

  fn pod(name: &str, workflow: &str) -> Pod {
    Pod {
      metadata: ObjectMeta::new("default", name).with_label("workflow", workflow),
      ..Default::default()
    }
  }

  fn api() -> MemoryApi<Pod> {
    MemoryApi::new(Arc::new(AtomicU64::new(0)))
  }

  #[tokio::test]
  async fn test_create_assigns_identity() {
    let api = api();
    let created = api.create(pod("a", "wf")).await.unwrap();
    assert!(!created.metadata.uid.is_empty());
    assert!(created.metadata.creation_timestamp.is_some());
    assert_eq!(created.metadata.resource_version, 1);

    let err = api.create(pod("a", "wf")).await.unwrap_err();
    assert!(err.is_already_exists());
  }

  #[tokio::test]
  async fn test_create_fills_pod_uid_env() {
    let api = api();
    let mut pod = pod("a", "wf");
    pod.spec.containers.push(loom_config::Container {
      name: "main".into(),
      env: vec![loom_config::EnvVar::field("POD_UID", "metadata.uid")],
      ..Default::default()
    });
    let created = api.create(pod).await.unwrap();
    let main = created.container("main").unwrap();
    assert_eq!(main.env_var("POD_UID"), Some(created.metadata.uid.as_str()));

    let stored = api.get("default", "a").await.unwrap();
    let main = stored.container("main").unwrap();
    assert_eq!(main.env_var("POD_UID"), Some(stored.metadata.uid.as_str()));
  }

  #[tokio::test]
  async fn test_replace_is_compare_and_set() {
    let api = api();
    let created = api.create(pod("a", "wf")).await.unwrap();

    let mut first = created.clone();
    first.status.message = Some("one".into());
    let updated = api.replace(first).await.unwrap();
    assert!(updated.metadata.resource_version > created.metadata.resource_version);

    let mut stale = created;
    stale.status.message = Some("two".into());
    let err = api.replace(stale).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
      api.get("default", "a").await.unwrap().status.message.as_deref(),
      Some("one")
    );
  }

  #[tokio::test]
  async fn test_graceful_delete_marks_then_removes() {
    let api = api();
    api.create(pod("a", "wf")).await.unwrap();

    api
      .delete("default", "a", &DeleteParams::graceful(5))
      .await
      .unwrap();
    let marked = api.get("default", "a").await.unwrap();
    assert!(marked.metadata.is_deleting());
    assert_eq!(marked.metadata.deletion_grace_period_seconds, Some(5));

    api
      .delete("default", "a", &DeleteParams::immediate())
      .await
      .unwrap();
    assert!(api.get("default", "a").await.unwrap_err().is_not_found());
  }

  #[tokio::test]
  async fn test_delete_collection_by_label() {
    let api = api();
    api.create(pod("a", "one")).await.unwrap();
    api.create(pod("b", "one")).await.unwrap();
    api.create(pod("c", "two")).await.unwrap();

    let params = ListParams::namespaced("default")
      .with_selector(LabelSelector::new().equals("workflow", "one"));
    let deleted = api
      .delete_collection(&params, &DeleteParams::immediate())
      .await
      .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(api.snapshot().len(), 1);
  }

  #[tokio::test]
  async fn test_watch_replays_then_streams() {
    let api = api();
    let list = api.list(&ListParams::all()).await.unwrap();
    api.create(pod("a", "wf")).await.unwrap();

    let mut stream = api.watch(&ListParams::all(), list.resource_version).await.unwrap();
    api.create(pod("b", "wf")).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert!(matches!(first, WatchEvent::Added(ref p) if p.metadata.name == "a"));
    let second = stream.next().await.unwrap().unwrap();
    assert!(matches!(second, WatchEvent::Added(ref p) if p.metadata.name == "b"));
  }

  #[tokio::test]
  async fn test_watch_from_compacted_marker_is_gone() {
    let api = api();
    api.create(pod("a", "wf")).await.unwrap();
    api.create(pod("b", "wf")).await.unwrap();
    api.compact();
    let err = match api.watch(&ListParams::all(), 1).await {
      Ok(_) => panic!("expected Gone"),
      Err(e) => e,
    };
    assert!(matches!(err, ClusterError::Gone(1)));
  }

  #[tokio::test]
  async fn test_injected_failure_fires_once() {
    let api = api();
    api.fail_next(Operation::Create, ClusterError::Unavailable("down".into()));
    assert!(api.create(pod("a", "wf")).await.unwrap_err().is_transient());
    api.create(pod("a", "wf")).await.unwrap();
  }
}
