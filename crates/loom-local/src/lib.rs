//! Loom Local
//!
//! Stands in for a node agent when loom runs on a single host. The
//! [`LocalKubelet`] watches for pods the controller creates and plays each
//! one out in-process with the executor roles: `init` stages the agent
//! directory, `emissary` runs the user command as a host process and `wait`
//! writes the task result. Signals the controller sends land in the pod's
//! signal file, exactly as they would on a cluster.

mod error;
mod kubelet;

pub use error::{LocalError, Result};
pub use kubelet::LocalKubelet;
