use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use loom_config::ObjectMeta;

use crate::error::Result;
use crate::resource::Resource;
use crate::selector::LabelSelector;

/// Filter for list, watch and delete-collection calls.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
  /// `None` spans all namespaces.
  pub namespace: Option<String>,
  pub selector: LabelSelector,
}

impl ListParams {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn namespaced(namespace: impl Into<String>) -> Self {
    Self {
      namespace: Some(namespace.into()),
      selector: LabelSelector::default(),
    }
  }

  pub fn with_selector(mut self, selector: LabelSelector) -> Self {
    self.selector = selector;
    self
  }

  pub fn matches(&self, meta: &ObjectMeta) -> bool {
    self.namespace.as_ref().is_none_or(|ns| *ns == meta.namespace)
      && self.selector.matches(&meta.labels)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteParams {
  /// Seconds a graceful kind may take to shut down. `Some(0)` removes the
  /// object immediately.
  pub grace_period_seconds: Option<u64>,
}

impl DeleteParams {
  pub fn immediate() -> Self {
    Self {
      grace_period_seconds: Some(0),
    }
  }

  pub fn graceful(seconds: u64) -> Self {
    Self {
      grace_period_seconds: Some(seconds),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ObjectList<K> {
  pub items: Vec<K>,
  /// Marker to resume a watch from, consistent with `items`.
  pub resource_version: u64,
}

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
  Added(K),
  Modified(K),
  Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
  pub fn object(&self) -> &K {
    match self {
      WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
    }
  }

  pub fn resource_version(&self) -> u64 {
    self.object().meta().resource_version
  }
}

pub type WatchStream<K> = Pin<Box<dyn Stream<Item = Result<WatchEvent<K>>> + Send>>;

/// Access to one kind of cluster object.
#[async_trait]
pub trait Api<K: Resource>: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<K>;

  async fn list(&self, params: &ListParams) -> Result<ObjectList<K>>;

  /// Fails with `AlreadyExists` when the name is taken.
  async fn create(&self, object: K) -> Result<K>;

  /// Compare-and-set on `metadata.resource_version`; fails with `Conflict`
  /// when the stored object moved on.
  async fn replace(&self, object: K) -> Result<K>;

  async fn delete(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()>;

  /// Delete every object matching `params`. Returns how many were deleted.
  async fn delete_collection(&self, params: &ListParams, delete: &DeleteParams) -> Result<usize>;

  /// Events after `resource_version`. Fails (immediately or mid-stream) with
  /// `Gone` when the marker is older than the retained history.
  async fn watch(&self, params: &ListParams, resource_version: u64) -> Result<WatchStream<K>>;
}
