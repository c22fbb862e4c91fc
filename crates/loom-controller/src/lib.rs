//! Loom Controller
//!
//! Keeps workflows moving. Informers mirror workflows, pods and task results
//! into local caches and push the owning workflow key onto a deduplicating
//! work queue. A bounded pool of workers takes keys off the queue, one
//! reconcile per key at a time: the [`Reconciler`] runs the operator over the
//! cached snapshot, has the [`PodOrchestrator`] create, kill and relabel pods,
//! and writes the new status back with a compare-and-swap replace.
//!
//! Requeue hints and retry backoffs go through a single timer per key.
//! [`Retention`] runs beside the workers and deletes what has outlived its
//! TTL or retention budget.

mod backoff;
mod config;
mod controller;
mod deps;
mod error;
mod events;
mod informer;
mod orchestrator;
mod queue;
mod reconciler;
mod retention;
mod timer;

pub use backoff::RequeueBackoff;
pub use config::{
  ArchiveSettings, ControllerConfig, ExecutorSettings, RateLimit, Requeue, RetentionPolicy,
};
pub use controller::{Controller, open_archive};
pub use deps::{Caches, Dependencies};
pub use error::{ControllerError, Result};
pub use events::{
  ChannelRecorder, ClusterRecorder, EventRecorder, NoopRecorder, Reason, WorkflowEvent,
};
pub use informer::{Cache, Informer, OwnerIndex, workflow_owner};
pub use orchestrator::{Ensure, PodOrchestrator};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use retention::{Retention, Sweep};
pub use timer::TimerWheel;
