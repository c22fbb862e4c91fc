//! Human-visible status transitions.
//!
//! The reconciler turns operator transitions into [`WorkflowEvent`]s and hands
//! them to an [`EventRecorder`]. Implementations decide what to do with them:
//! write cluster events, forward them to a channel, or drop them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use loom_cluster::{Api, Event, EventType, ObjectReference, Resource};
use loom_config::ObjectMeta;
use loom_operator::Transition;
use loom_workflow::{NodePhase, Workflow, WorkflowPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
  WorkflowRunning,
  WorkflowSucceeded,
  WorkflowFailed,
  NodeSucceeded,
  NodeFailed,
  NodeError,
}

impl Reason {
  pub fn as_str(self) -> &'static str {
    match self {
      Reason::WorkflowRunning => "WorkflowRunning",
      Reason::WorkflowSucceeded => "WorkflowSucceeded",
      Reason::WorkflowFailed => "WorkflowFailed",
      Reason::NodeSucceeded => "NodeSucceeded",
      Reason::NodeFailed => "NodeFailed",
      Reason::NodeError => "NodeError",
    }
  }

  pub fn is_node(self) -> bool {
    matches!(self, Reason::NodeSucceeded | Reason::NodeFailed | Reason::NodeError)
  }

  pub fn event_type(self) -> EventType {
    match self {
      Reason::WorkflowFailed | Reason::NodeFailed | Reason::NodeError => EventType::Warning,
      _ => EventType::Normal,
    }
  }
}

impl std::fmt::Display for Reason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
  pub workflow: ObjectReference,
  pub reason: Reason,
  pub message: String,
  pub at: DateTime<Utc>,
}

impl WorkflowEvent {
  /// The event a transition is reported as, if any. Pending and running
  /// nodes are not reported.
  pub fn from_transition(
    workflow: &Workflow,
    transition: &Transition,
    at: DateTime<Utc>,
  ) -> Option<Self> {
    let (reason, message) = match transition {
      Transition::Workflow { phase, message } => {
        let reason = match phase {
          WorkflowPhase::Running => Reason::WorkflowRunning,
          WorkflowPhase::Succeeded => Reason::WorkflowSucceeded,
          WorkflowPhase::Failed | WorkflowPhase::Error => Reason::WorkflowFailed,
          WorkflowPhase::Pending => return None,
        };
        let text = match message {
          Some(m) => format!("Workflow {}: {m}", phase.as_str()),
          None => format!("Workflow {}", phase.as_str()),
        };
        (reason, text)
      }
      Transition::Node {
        name,
        phase,
        message,
        ..
      } => {
        let reason = match phase {
          NodePhase::Succeeded => Reason::NodeSucceeded,
          NodePhase::Failed => Reason::NodeFailed,
          NodePhase::Error => Reason::NodeError,
          _ => return None,
        };
        let text = match message {
          Some(m) => format!("{} node {name}: {m}", phase.as_str()),
          None => format!("{} node {name}", phase.as_str()),
        };
        (reason, text)
      }
    };
    Some(Self {
      workflow: ObjectReference {
        kind: Workflow::KIND.to_string(),
        namespace: workflow.namespace().to_string(),
        name: workflow.name().to_string(),
        uid: workflow.metadata.uid.clone(),
      },
      reason,
      message,
      at,
    })
  }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
  async fn record(&self, event: WorkflowEvent);
}

#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
  async fn record(&self, _event: WorkflowEvent) {}
}

/// Forwards events to an unbounded channel; a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
  sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelRecorder {
  pub fn new(sender: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl EventRecorder for ChannelRecorder {
  async fn record(&self, event: WorkflowEvent) {
    let _ = self.sender.send(event);
  }
}

/// Writes cluster `Event` objects against the workflow, honouring the
/// node/workflow event switches.
pub struct ClusterRecorder {
  events: Arc<dyn Api<Event>>,
  node_events: bool,
  workflow_events: bool,
}

impl ClusterRecorder {
  pub fn new(events: Arc<dyn Api<Event>>, node_events: bool, workflow_events: bool) -> Self {
    Self {
      events,
      node_events,
      workflow_events,
    }
  }
}

#[async_trait]
impl EventRecorder for ClusterRecorder {
  async fn record(&self, event: WorkflowEvent) {
    let enabled = if event.reason.is_node() {
      self.node_events
    } else {
      self.workflow_events
    };
    if !enabled {
      return;
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let object = Event {
      metadata: ObjectMeta::new(
        &event.workflow.namespace,
        format!("{}.{}", event.workflow.name, &suffix[..12]),
      ),
      involved_object: event.workflow.clone(),
      reason: event.reason.as_str().to_string(),
      message: event.message,
      event_type: event.reason.event_type(),
      first_timestamp: Some(event.at),
      last_timestamp: Some(event.at),
      count: 1,
    };
    if let Err(err) = self.events.create(object).await {
      warn!(workflow = %event.workflow.name, reason = %event.reason, error = %err, "failed to record event");
    }
  }
}
