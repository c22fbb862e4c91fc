//! Names shared by the controller, the pods it builds and the executor agent
//! running inside them.

/// Workflow name on every pod and task result.
pub const LABEL_WORKFLOW: &str = "workflows.argoproj.io/workflow";
pub const LABEL_WORKFLOW_NAMESPACE: &str = "workflows.argoproj.io/workflow-namespace";
/// `"false"` while the owning node is live, `"true"` once the controller has
/// recorded its outcome.
pub const LABEL_COMPLETED: &str = "workflows.argoproj.io/completed";
pub const LABEL_NODE_ID: &str = "workflows.argoproj.io/node-id";
pub const LABEL_CONTROLLER_INSTANCE_ID: &str = "workflows.argoproj.io/controller-instanceid";
pub const LABEL_GROUP: &str = "workflows.argoproj.io/group";

pub const ANNOTATION_NODE_ID: &str = "workflows.argoproj.io/node-id";
pub const ANNOTATION_NODE_NAME: &str = "workflows.argoproj.io/node-name";

pub const INIT_CONTAINER: &str = "init";
pub const MAIN_CONTAINER: &str = "main";
pub const WAIT_CONTAINER: &str = "wait";

/// Name of the shared volume mounted at the agent root in every container.
pub const AGENT_VOLUME: &str = "loom-agent";
/// Name of the config-map volume carrying an offloaded template.
pub const TEMPLATE_VOLUME: &str = "loom-template";

pub const DEFAULT_AGENT_ROOT: &str = "/var/run/loom";

/// Exit code the agent writes when it faults itself, as opposed to the user
/// command failing.
pub const AGENT_FAULT_EXIT_CODE: i32 = 64;

/// Template payloads above this size travel through a config map.
pub const MAX_ENV_TEMPLATE_BYTES: usize = 128 * 1024;
/// Value of [`env::TEMPLATE`] when the payload was offloaded.
pub const OFFLOADED: &str = "offloaded";
/// Key of the template inside an offload config map.
pub const OFFLOAD_KEY: &str = "template";

/// Environment variables passed to the agent.
pub mod env {
  pub const POD_NAME: &str = "LOOM_POD_NAME";
  pub const POD_UID: &str = "LOOM_POD_UID";
  pub const WORKFLOW_NAME: &str = "LOOM_WORKFLOW_NAME";
  pub const WORKFLOW_NAMESPACE: &str = "LOOM_WORKFLOW_NAMESPACE";
  pub const WORKFLOW_UID: &str = "LOOM_WORKFLOW_UID";
  pub const NODE_ID: &str = "LOOM_NODE_ID";
  /// RFC3339 instant after which the agent terminates the command.
  pub const DEADLINE: &str = "LOOM_DEADLINE";
  /// How often the wait sidecar checks for the exit code.
  pub const PROGRESS_TICK: &str = "LOOM_PROGRESS_TICK";
  /// Poll interval backing the signal file watcher.
  pub const SIGNAL_POLL: &str = "LOOM_SIGNAL_POLL";
  /// JSON template payload, or [`super::OFFLOADED`].
  pub const TEMPLATE: &str = "LOOM_TEMPLATE";
  /// Mount path of the offloaded template config map.
  pub const TEMPLATE_MOUNT: &str = "LOOM_TEMPLATE_MOUNT";
  pub const INCLUDE_SCRIPT_OUTPUT: &str = "LOOM_INCLUDE_SCRIPT_OUTPUT";
  pub const AGENT_ROOT: &str = "LOOM_AGENT_ROOT";
  pub const TERMINATION_GRACE: &str = "LOOM_TERMINATION_GRACE";
  /// Root of the filesystem artifact sink.
  pub const ARTIFACT_ROOT: &str = "LOOM_ARTIFACT_ROOT";
}

/// Files under the agent root.
pub mod files {
  pub const TEMPLATE: &str = "template";
  pub const SIGNAL: &str = "signal";
  pub const STDOUT: &str = "stdout";
  pub const STDERR: &str = "stderr";
  pub const EXITCODE: &str = "exitcode";
  pub const SCRIPT: &str = "script";
  pub const AGENT_BINARY: &str = "loom-exec";
  pub const OUTPUT_PARAMETERS: &str = "outputs/parameters";
  pub const OUTPUT_ARTIFACTS: &str = "outputs/artifacts";
  /// Written by the wait sidecar when it cannot reach the cluster.
  pub const RESULT: &str = "outputs/result.json";
  /// Why the agent faulted; present only alongside the reserved exit code.
  pub const FAULT: &str = "fault";
}
