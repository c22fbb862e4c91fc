//! Loom Executor
//!
//! The agent that runs inside every task pod. It plays three roles, one per
//! container:
//!
//! - [`run_init`] stages the template, script and input artifacts on the
//!   shared volume
//! - [`run_emissary`] replaces the main container's command: it supervises
//!   the user process, forwards signals from the signal file, enforces the
//!   deadline and captures declared outputs
//! - [`run_wait`] waits for `exitcode`, uploads artifacts and writes the
//!   task result
//!
//! Resource templates skip the pod command entirely; [`execute_resource`]
//! acts on the cluster object and reports a result the same way.

mod capture;
mod config;
mod emissary;
mod error;
mod init;
mod paths;
pub mod payload;
mod resource;
pub mod signal;
pub mod tarball;
mod wait;

pub use capture::capture_outputs;
pub use config::AgentConfig;
pub use emissary::{command_line, exit_code, read_exit_code, run_emissary};
pub use error::{ExecutorError, Result};
pub use init::run_init;
pub use paths::AgentPaths;
pub use resource::{execute_resource, json_path, run_resource};
pub use wait::{ApiResultWriter, FileResultWriter, ResultWriter, run_wait};
