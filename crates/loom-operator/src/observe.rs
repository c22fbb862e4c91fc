use chrono::{DateTime, Utc};

use loom_cluster::{Pod, PodPhase, TaskResult};
use loom_config::{Outputs, Template};
use loom_workflow::contract::{AGENT_FAULT_EXIT_CODE, MAIN_CONTAINER};
use loom_workflow::{NodePhase, NodeStatus, ResourcesDuration};

use crate::outcome::Limits;

/// What the cluster says about a leaf whose pod was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
  /// Nothing decisive yet; look again at the instant, if given.
  Waiting(Option<DateTime<Utc>>),
  Running,
  Done {
    phase: NodePhase,
    message: Option<String>,
    outputs: Option<Outputs>,
    resources: ResourcesDuration,
  },
}

/// Synthesize a leaf phase from its pod and task result.
///
/// A succeeded pod is only final once the agent's task result arrived; the
/// result carries the captured outputs.
pub fn observe(
  node: &NodeStatus,
  template: &Template,
  pod: Option<&Pod>,
  result: Option<&TaskResult>,
  now: DateTime<Utc>,
  limits: &Limits,
) -> Observed {
  let Some(pod) = pod else {
    let requested = node.started_at.unwrap_or(now);
    let due = requested + chrono::Duration::from_std(limits.pod_missing_grace).unwrap_or_default();
    if now < due {
      return Observed::Waiting(Some(due));
    }
    return done(NodePhase::Error, Some("pod deleted".to_string()), None, ResourcesDuration::default());
  };

  match pod.status.phase {
    PodPhase::Pending => Observed::Waiting(None),
    PodPhase::Running | PodPhase::Unknown => Observed::Running,
    PodPhase::Succeeded => {
      let Some(result) = result else {
        let finished = pod
          .finished_at(MAIN_CONTAINER)
          .or(node.started_at)
          .unwrap_or(now);
        let due = finished + chrono::Duration::from_std(limits.result_grace).unwrap_or_default();
        if now < due {
          return Observed::Waiting(Some(due));
        }
        return done(
          NodePhase::Error,
          Some("task result missing".to_string()),
          None,
          resources(node, template, pod, None, now),
        );
      };
      let outputs = outputs_of(pod, Some(result));
      let resources = resources(node, template, pod, Some(result), now);
      if result.phase == Some(NodePhase::Error) {
        return done(NodePhase::Error, result.message.clone(), outputs, resources);
      }
      done(NodePhase::Succeeded, None, outputs, resources)
    }
    PodPhase::Failed => {
      let outputs = outputs_of(pod, result);
      let resources = resources(node, template, pod, result, now);
      let (phase, message) = match pod.exit_code(MAIN_CONTAINER) {
        None => (
          NodePhase::Error,
          pod
            .status
            .message
            .clone()
            .or(pod.status.reason.clone())
            .unwrap_or_else(|| "pod failed".to_string()),
        ),
        Some(AGENT_FAULT_EXIT_CODE)
          if result.is_none_or(|r| r.phase == Some(NodePhase::Error)) =>
        {
          (
            NodePhase::Error,
            result
              .and_then(|r| r.message.clone())
              .unwrap_or_else(|| "executor agent fault".to_string()),
          )
        }
        Some(_) if result.is_some_and(|r| r.phase == Some(NodePhase::Error)) => (
          NodePhase::Error,
          result
            .and_then(|r| r.message.clone())
            .unwrap_or_else(|| "pod failed".to_string()),
        ),
        Some(code) => (NodePhase::Failed, format!("Error (exit code {code})")),
      };
      done(phase, Some(message), outputs, resources)
    }
  }
}

fn done(
  phase: NodePhase,
  message: Option<String>,
  outputs: Option<Outputs>,
  resources: ResourcesDuration,
) -> Observed {
  Observed::Done {
    phase,
    message,
    outputs,
    resources,
  }
}

fn outputs_of(pod: &Pod, result: Option<&TaskResult>) -> Option<Outputs> {
  let mut outputs = result.map(|r| r.outputs.clone()).unwrap_or_default();
  if let Some(code) = pod.exit_code(MAIN_CONTAINER) {
    outputs.exit_code = Some(code);
  }
  (!outputs.is_empty()).then_some(outputs)
}

fn resources(
  node: &NodeStatus,
  template: &Template,
  pod: &Pod,
  result: Option<&TaskResult>,
  now: DateTime<Utc>,
) -> ResourcesDuration {
  if let Some(result) = result
    && !result.resources_duration.is_empty()
  {
    return result.resources_duration.clone();
  }
  let started = pod.status.start_time.or(node.started_at).unwrap_or(now);
  let finished = pod.finished_at(MAIN_CONTAINER).unwrap_or(now);
  let elapsed = finished.signed_duration_since(started).num_milliseconds() as f64 / 1000.0;
  let requests = template
    .main_container()
    .map(|c| c.resources.requests.clone())
    .unwrap_or_default();
  ResourcesDuration::estimate(&requests, elapsed)
}
