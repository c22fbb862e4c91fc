//! Loom Workflow
//!
//! The runtime model of a workflow: the persisted [`Workflow`] object, its
//! [`WorkflowStatus`] and the flat node tree inside it.
//!
//! The node tree is a map `id -> NodeStatus`; parents and children refer to
//! each other by id, never by pointer. Walking up (to roll a composite phase)
//! and down (to cascade an omit) are map lookups, and snapshotting the tree is
//! a single clone.
//!
//! Node identifiers are derived, never allocated: the same spec expanded in the
//! same order always produces the same ids (see [`node_id`]).

pub mod contract;
mod depends;
mod error;
mod graph;
mod group;
mod id;
mod library;
mod node;
mod phase;
mod status;
mod validate;
mod workflow;

pub use depends::{DependsExpr, Qualifier};
pub use error::WorkflowError;
pub use graph::DagGraph;
pub use group::{GroupPhase, WorkflowGroup, WorkflowGroupSpec, WorkflowGroupStatus};
pub use id::{NodeKey, node_id};
pub use library::TemplateLibrary;
pub use node::{NodeStatus, NodeType, ResourcesDuration};
pub use phase::{NodePhase, WorkflowPhase};
pub use status::{Nodes, WorkflowStatus};
pub use validate::validate;
pub use workflow::{
  ClusterWorkflowTemplate, TemplateScope, Workflow, WorkflowTemplate, resume_workflow,
  stop_workflow, stored_template_key,
};
