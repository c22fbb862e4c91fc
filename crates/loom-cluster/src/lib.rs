//! Loom Cluster
//!
//! The narrow interface between loom and the container-orchestrator cluster.
//! Everything the controller and the agent need from the cluster goes through
//! the generic [`Api`] trait: reads, compare-and-set writes, label-selected
//! deletes and resumable watch streams.
//!
//! The crate also defines the object kinds loom reads and writes ([`Pod`],
//! [`TaskResult`], [`Event`], [`ConfigMap`], [`DynamicObject`]) and an
//! in-memory implementation ([`MemoryCluster`]) used by local mode and tests.

mod api;
mod cluster;
mod error;
mod memory;
mod objects;
mod pod;
mod resource;
mod selector;
mod signal;

pub use api::{Api, DeleteParams, ListParams, ObjectList, WatchEvent, WatchStream};
pub use cluster::Cluster;
pub use error::{ClusterError, Result};
pub use memory::{MemoryApi, MemoryCluster, Operation};
pub use objects::{ConfigMap, DynamicObject, Event, EventType, ObjectReference, TaskResult};
pub use pod::{
  ConfigMapVolume, ContainerState, ContainerStatus, Pod, PodPhase, PodSpec, PodStatus, Volume,
};
pub use resource::Resource;
pub use selector::LabelSelector;
pub use signal::{MemorySignaler, PodSignaler};
