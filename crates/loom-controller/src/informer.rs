//! List-then-watch caches of cluster objects.
//!
//! An [`Informer`] keeps a [`Cache`] in step with one kind: it lists, hands
//! every listed object to its handler as a synthetic event, then watches from
//! the list's resource version. A watch that ends is reopened from the last
//! seen version; one that reports `Gone` falls back to a fresh list.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loom_cluster::{Api, ClusterError, ListParams, Resource, WatchEvent};
use loom_config::ObjectMeta;
use loom_workflow::contract::LABEL_WORKFLOW;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Groups objects under the key of the workflow that owns them.
pub type OwnerIndex = fn(&ObjectMeta) -> Option<String>;

/// `namespace/workflow` from the workflow label.
pub fn workflow_owner(meta: &ObjectMeta) -> Option<String> {
  meta
    .label(LABEL_WORKFLOW)
    .map(|name| format!("{}/{name}", meta.namespace))
}

struct Inner<K> {
  objects: BTreeMap<String, K>,
  owners: HashMap<String, BTreeSet<String>>,
}

/// Read-mostly view of one kind. Written only by its informer.
pub struct Cache<K> {
  inner: RwLock<Inner<K>>,
  index: Option<OwnerIndex>,
  synced: watch::Sender<bool>,
}

impl<K: Resource> Cache<K> {
  pub fn new() -> Self {
    Self::build(None)
  }

  pub fn with_owner_index(index: OwnerIndex) -> Self {
    Self::build(Some(index))
  }

  fn build(index: Option<OwnerIndex>) -> Self {
    let (synced, _) = watch::channel(false);
    Self {
      inner: RwLock::new(Inner {
        objects: BTreeMap::new(),
        owners: HashMap::new(),
      }),
      index,
      synced,
    }
  }

  pub fn get(&self, key: &str) -> Option<K> {
    self.inner.read().objects.get(key).cloned()
  }

  pub fn list(&self) -> Vec<K> {
    self.inner.read().objects.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.read().objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Objects indexed under `owner`, in key order.
  pub fn owned_by(&self, owner: &str) -> Vec<K> {
    let inner = self.inner.read();
    inner
      .owners
      .get(owner)
      .into_iter()
      .flatten()
      .filter_map(|key| inner.objects.get(key).cloned())
      .collect()
  }

  pub fn is_synced(&self) -> bool {
    *self.synced.borrow()
  }

  /// Resolve once the first list has landed.
  pub async fn wait_synced(&self) {
    let mut synced = self.synced.subscribe();
    // The sender lives as long as the cache, so this cannot fail.
    let _ = synced.wait_for(|s| *s).await;
  }

  pub(crate) fn upsert(&self, object: K) {
    let key = object.meta().key();
    let owner = self.index.and_then(|index| index(object.meta()));
    let mut inner = self.inner.write();
    if let Some(owner) = owner {
      inner.owners.entry(owner).or_default().insert(key.clone());
    }
    inner.objects.insert(key, object);
  }

  fn remove(&self, object: &K) {
    let key = object.meta().key();
    let mut inner = self.inner.write();
    let Some(stored) = inner.objects.remove(&key) else {
      return;
    };
    if let Some(owner) = self.index.and_then(|index| index(stored.meta()))
      && let Some(keys) = inner.owners.get_mut(&owner)
    {
      keys.remove(&key);
      if keys.is_empty() {
        inner.owners.remove(&owner);
      }
    }
  }

  /// Replace the contents with a fresh list. Returns the objects that
  /// disappeared since the previous state.
  fn reset(&self, items: Vec<K>) -> Vec<K> {
    let listed: BTreeSet<String> = items.iter().map(|o| o.meta().key()).collect();
    let vanished: Vec<K> = {
      let inner = self.inner.read();
      inner
        .objects
        .iter()
        .filter(|(key, _)| !listed.contains(*key))
        .map(|(_, o)| o.clone())
        .collect()
    };
    for object in &vanished {
      self.remove(object);
    }
    for object in items {
      self.upsert(object);
    }
    vanished
  }

  fn apply(&self, event: &WatchEvent<K>) {
    match event {
      WatchEvent::Added(o) | WatchEvent::Modified(o) => self.upsert(o.clone()),
      WatchEvent::Deleted(o) => self.remove(o),
    }
  }
}

impl<K: Resource> Default for Cache<K> {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Informer<K: Resource> {
  api: Arc<dyn Api<K>>,
  params: ListParams,
  cache: Arc<Cache<K>>,
}

enum Resume {
  Relist,
  Watch(u64),
}

impl<K: Resource> Informer<K> {
  pub fn new(api: Arc<dyn Api<K>>, params: ListParams, cache: Arc<Cache<K>>) -> Self {
    Self { api, params, cache }
  }

  /// Keep the cache current until cancelled, calling `on_change` for every
  /// object that was listed, added, modified or deleted.
  pub async fn run<F>(self, on_change: F, cancel: CancellationToken)
  where
    F: Fn(&K) + Send + Sync,
  {
    let mut resume = Resume::Relist;
    loop {
      if cancel.is_cancelled() {
        return;
      }
      resume = match resume {
        Resume::Relist => match self.relist(&on_change).await {
          Ok(version) => Resume::Watch(version),
          Err(err) => {
            warn!(kind = K::KIND, error = %err, "list failed; retrying");
            if !pause(&cancel).await {
              return;
            }
            Resume::Relist
          }
        },
        Resume::Watch(version) => match self.watch(version, &on_change, &cancel).await {
          Some(next) => next,
          None => return,
        },
      };
    }
  }

  async fn relist<F: Fn(&K)>(&self, on_change: &F) -> Result<u64, ClusterError> {
    let list = self.api.list(&self.params).await?;
    let count = list.items.len();
    let vanished = self.cache.reset(list.items.clone());
    for object in list.items.iter().chain(&vanished) {
      on_change(object);
    }
    if !self.cache.is_synced() {
      info!(kind = K::KIND, objects = count, "cache synced");
    }
    self.cache.synced.send_replace(true);
    Ok(list.resource_version)
  }

  /// Follow one watch stream. `None` when cancelled.
  async fn watch<F: Fn(&K)>(
    &self,
    mut version: u64,
    on_change: &F,
    cancel: &CancellationToken,
  ) -> Option<Resume> {
    let mut stream = match self.api.watch(&self.params, version).await {
      Ok(stream) => stream,
      Err(ClusterError::Gone(_)) => {
        debug!(kind = K::KIND, version, "watch marker expired; relisting");
        return Some(Resume::Relist);
      }
      Err(err) => {
        warn!(kind = K::KIND, error = %err, "watch failed; retrying");
        return pause(cancel).await.then_some(Resume::Watch(version));
      }
    };
    loop {
      let next = tokio::select! {
        _ = cancel.cancelled() => return None,
        next = stream.next() => next,
      };
      match next {
        Some(Ok(event)) => {
          version = version.max(event.resource_version());
          self.cache.apply(&event);
          on_change(event.object());
        }
        Some(Err(ClusterError::Gone(_))) => {
          debug!(kind = K::KIND, version, "watch fell behind; relisting");
          return Some(Resume::Relist);
        }
        Some(Err(err)) => {
          warn!(kind = K::KIND, error = %err, "watch stream error; reopening");
          return Some(Resume::Watch(version));
        }
        None => {
          debug!(kind = K::KIND, version, "watch closed; reopening");
          return Some(Resume::Watch(version));
        }
      }
    }
  }
}

/// Sleep before a retry. False when cancelled instead.
async fn pause(cancel: &CancellationToken) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => false,
    _ = tokio::time::sleep(RETRY_DELAY) => true,
  }
}
