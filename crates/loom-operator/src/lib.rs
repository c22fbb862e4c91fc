//! Loom Operator
//!
//! The decision core of the controller. [`operate`] takes a snapshot of one
//! workflow (its persisted status plus the pods and task results labelled
//! with it) and returns the next status together with the cluster actions
//! that move the workflow forward.
//!
//! The operator never talks to the cluster. Running it twice on the same
//! snapshot yields the same status and the same actions; the controller is
//! responsible for applying them and for treating "already exists" as done.
//!
//! One pass:
//! - initialises the workflow on first sight (freezes the referenced templates
//!   into the status and validates them)
//! - folds pod and task-result observations into the leaf nodes
//! - expands the node tree from the entrypoint: DAG tasks, step groups,
//!   iterations, retries and suspends
//! - rolls phases up to the workflow

mod init;
mod inputs;
mod iterate;
mod observe;
mod operator;
mod outcome;
mod retry;
mod scope;
mod when;

pub use init::{Materialized, materialize, referenced_scopes};
pub use observe::{Observed, observe};
pub use operator::operate;
pub use outcome::{Action, KillCause, Limits, Outcome, PodRequest, Snapshot, Transition};
pub use retry::is_transient;
pub use scope::{Renderer, Scope, Unresolved};
