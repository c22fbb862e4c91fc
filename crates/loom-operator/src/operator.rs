use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use loom_cluster::{Pod, TaskResult};
use loom_config::duration::{format_duration, parse_duration};
use loom_config::{
  Arguments, Artifact, ContinueOn, DagTask, Inputs, IntOrString, Iteration, Outputs, Parameter,
  ShutdownStrategy, Template, TemplateKind, TemplateRef, WorkflowSpec, WorkflowStep,
};
use loom_workflow::contract::{LABEL_COMPLETED, LABEL_NODE_ID};
use loom_workflow::{
  DagGraph, NodeKey, NodePhase, NodeStatus, NodeType, Nodes, Qualifier, ResourcesDuration,
  TemplateScope, Workflow, WorkflowPhase, node_id, stored_template_key,
};

use crate::init::materialize;
use crate::inputs::{bind_inputs, input_scope, render_leaf, resolve_arguments};
use crate::iterate;
use crate::observe::{Observed, observe};
use crate::outcome::{Action, KillCause, Limits, Outcome, PodRequest, Snapshot, Transition};
use crate::retry::{self, Decision};
use crate::scope::{Renderer, Scope, Unresolved};
use crate::when;

/// Advance a workflow by one generation.
pub fn operate(snapshot: &Snapshot<'_>) -> Outcome {
  let workflow = snapshot.workflow;
  let now = snapshot.now;
  let mut status = workflow.status.clone();
  let mut transitions = Vec::new();

  if workflow.is_completed() {
    let actions = completed_pods(&status.nodes, snapshot.pods);
    return Outcome {
      status,
      actions,
      requeue_after: None,
      transitions,
    };
  }

  let renderer = Renderer::new();
  if status.stored_templates.is_empty() {
    match materialize(workflow, snapshot.libraries, &renderer) {
      Ok(materialized) => {
        status.stored_templates = materialized.stored;
        status.stored_workflow_spec = materialized.merged.map(Box::new);
        status.started_at.get_or_insert(now);
      }
      Err(message) => {
        tracing::info!(workflow = %workflow.key(), %message, "workflow failed validation");
        status.phase = WorkflowPhase::Error;
        status.message = Some(message.clone());
        status.started_at.get_or_insert(now);
        status.finished_at = Some(now);
        transitions.push(Transition::Workflow {
          phase: WorkflowPhase::Error,
          message: Some(message),
        });
        return Outcome {
          status,
          actions: Vec::new(),
          requeue_after: None,
          transitions,
        };
      }
    }
  }

  let old_phase = workflow.status.phase;
  let old_nodes: BTreeMap<String, NodePhase> = status
    .nodes
    .iter()
    .map(|n| (n.id.clone(), n.phase))
    .collect();

  let mut spec = status
    .stored_workflow_spec
    .as_deref()
    .cloned()
    .unwrap_or_else(|| workflow.spec.clone());
  spec.shutdown = workflow.spec.shutdown;
  spec.suspend = workflow.spec.suspend;

  let deadline = status
    .started_at
    .zip(spec.active_deadline_seconds)
    .and_then(|(start, secs)| after(start, secs));
  let stopping = if deadline.is_some_and(|d| now >= d) {
    Some(Stopping {
      cause: KillCause::Deadline,
      kill_running: true,
    })
  } else {
    spec.shutdown.map(|strategy| Stopping {
      cause: KillCause::Cancelled,
      kill_running: strategy == ShutdownStrategy::Terminate,
    })
  };

  let templates = std::mem::take(&mut status.stored_templates);
  let result_refs = result_references(&templates);
  let globals = globals(workflow, &spec, &renderer);
  let mut op = Operation {
    workflow,
    limits: snapshot.limits,
    now,
    nodes: std::mem::take(&mut status.nodes),
    templates,
    pods: pods_by_node(snapshot.pods),
    results: snapshot
      .results
      .iter()
      .map(|r| (r.metadata.name.as_str(), r))
      .collect(),
    renderer,
    globals,
    spec,
    stopping,
    stopped_any: false,
    deadline,
    active: BTreeSet::new(),
    result_refs,
    actions: Vec::new(),
    wake: None,
    fatal: None,
  };
  if let Some(d) = deadline
    && now < d
  {
    op.wake(d);
  }

  let root_id = op.run();

  let Operation {
    nodes,
    templates,
    mut actions,
    wake,
    fatal,
    stopped_any,
    ..
  } = op;
  status.nodes = nodes;
  status.stored_templates = templates;

  if let Some(message) = fatal {
    status.phase = WorkflowPhase::Error;
    status.message = Some(message);
    status.finished_at = Some(now);
  } else if let Some(root) = status.nodes.get(&root_id)
    && root.is_fulfilled()
  {
    let (mut phase, mut message) = match root.phase {
      NodePhase::Succeeded | NodePhase::Skipped => (WorkflowPhase::Succeeded, None),
      NodePhase::Error => (WorkflowPhase::Error, root.message.clone()),
      _ => (WorkflowPhase::Failed, root.message.clone()),
    };
    if let Some(stop) = stopping
      && (stopped_any || phase != WorkflowPhase::Succeeded)
    {
      phase = WorkflowPhase::Failed;
      message = Some(stop.cause.to_string());
    }
    status.phase = phase;
    status.message = message;
    status.finished_at = Some(now);
  } else {
    status.phase = WorkflowPhase::Running;
    status.message = None;
  }

  let mut usage = ResourcesDuration::default();
  for node in status.nodes.iter().filter(|n| n.node_type == NodeType::Pod) {
    usage.add(&node.resources_duration);
  }
  status.resources_duration = usage;

  actions.extend(completed_pods(&status.nodes, snapshot.pods));

  for node in status.nodes.iter() {
    let changed = match old_nodes.get(&node.id) {
      Some(phase) => *phase != node.phase,
      None => node.phase != NodePhase::Pending,
    };
    if changed {
      transitions.push(Transition::Node {
        id: node.id.clone(),
        name: node.name.clone(),
        phase: node.phase,
        message: node.message.clone(),
      });
    }
  }
  if status.phase != old_phase {
    transitions.push(Transition::Workflow {
      phase: status.phase,
      message: status.message.clone(),
    });
  }

  let requeue_after = if status.phase.is_completed() {
    None
  } else {
    wake.map(|at| at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
  };

  Outcome {
    status,
    actions,
    requeue_after,
    transitions,
  }
}

fn after(start: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
  let delta = chrono::Duration::try_seconds(i64::try_from(secs).ok()?)?;
  start.checked_add_signed(delta)
}

fn pods_by_node(pods: &[Pod]) -> HashMap<&str, &Pod> {
  pods
    .iter()
    .filter_map(|p| p.metadata.label(LABEL_NODE_ID).map(|id| (id, p)))
    .collect()
}

/// Pods of finished nodes that still carry `completed=false`.
fn completed_pods(nodes: &Nodes, pods: &[Pod]) -> Vec<Action> {
  pods
    .iter()
    .filter(|p| p.metadata.label(LABEL_COMPLETED) != Some("true"))
    .filter(|p| {
      p.metadata
        .label(LABEL_NODE_ID)
        .and_then(|id| nodes.get(id))
        .is_some_and(NodeStatus::is_fulfilled)
    })
    .map(|p| Action::MarkCompleted {
      pod_name: p.metadata.name.clone(),
    })
    .collect()
}

fn globals(workflow: &Workflow, spec: &WorkflowSpec, renderer: &Renderer) -> Scope {
  let meta = &workflow.metadata;
  let mut scope = Scope::new();
  scope.set("workflow.name", &meta.name);
  scope.set("workflow.namespace", &meta.namespace);
  scope.set("workflow.uid", &meta.uid);
  if let Some(created) = meta.creation_timestamp {
    scope.set("workflow.creationTimestamp", created.to_rfc3339());
  }
  for (key, value) in &meta.labels {
    scope.set(format!("workflow.labels.{key}"), value);
  }

  let base = scope.clone();
  for param in &spec.arguments.parameters {
    if let Some(value) = param.effective_value() {
      let value = renderer
        .substitute(value, &base)
        .unwrap_or_else(|_| value.to_string());
      scope.set(format!("workflow.parameters.{}", param.name), value);
    }
  }
  scope
}

/// Names of tasks and steps whose `outputs.result` is referenced anywhere.
fn result_references(templates: &BTreeMap<String, Template>) -> BTreeSet<String> {
  let mut names = BTreeSet::new();
  for template in templates.values() {
    let Ok(text) = serde_json::to_string(template) else {
      continue;
    };
    for prefix in ["tasks.", "steps."] {
      let mut rest = text.as_str();
      while let Some(pos) = rest.find(prefix) {
        let tail = &rest[pos + prefix.len()..];
        let len = tail
          .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
          .unwrap_or(tail.len());
        if tail[len..].starts_with(".outputs.result") {
          names.insert(tail[..len].to_string());
        }
        rest = &tail[len..];
      }
    }
  }
  names
}

/// The task or step a node was created for: display names of iterations and
/// attempts carry `(..)` suffixes.
fn call_name(display: &str) -> &str {
  display.split('(').next().unwrap_or(display)
}

fn tolerates(continue_on: Option<ContinueOn>, phase: NodePhase) -> bool {
  let Some(c) = continue_on else {
    return false;
  };
  match phase {
    NodePhase::Failed => c.failed,
    NodePhase::Error => c.error,
    _ => false,
  }
}

fn kind_type(template: &Template) -> NodeType {
  match template.kind() {
    Ok(TemplateKind::Dag(_)) => NodeType::Dag,
    Ok(TemplateKind::Steps(_)) => NodeType::Steps,
    Ok(TemplateKind::Suspend(_)) => NodeType::Suspend,
    _ => NodeType::Pod,
  }
}

#[derive(Debug, Clone, Copy)]
struct Stopping {
  cause: KillCause,
  /// Terminate running pods; otherwise let them finish.
  kill_running: bool,
}

/// A DAG task or a step: one invocation of a template.
#[derive(Clone, Copy)]
struct Call<'c> {
  name: &'c str,
  template: &'c str,
  template_ref: Option<&'c TemplateRef>,
  arguments: &'c Arguments,
  when: Option<&'c str>,
  iteration: &'c Iteration,
  continue_on: Option<ContinueOn>,
}

impl<'c> From<&'c DagTask> for Call<'c> {
  fn from(task: &'c DagTask) -> Self {
    Self {
      name: &task.name,
      template: &task.template,
      template_ref: task.template_ref.as_ref(),
      arguments: &task.arguments,
      when: task.when.as_deref(),
      iteration: &task.iteration,
      continue_on: task.continue_on,
    }
  }
}

impl<'c> From<&'c WorkflowStep> for Call<'c> {
  fn from(step: &'c WorkflowStep) -> Self {
    Self {
      name: &step.name,
      template: &step.template,
      template_ref: step.template_ref.as_ref(),
      arguments: &step.arguments,
      when: step.when.as_deref(),
      iteration: &step.iteration,
      continue_on: step.continue_on,
    }
  }
}

/// Task or step name -> node id, for the calls visible from one composite.
type Siblings = BTreeMap<String, String>;

struct NewNode {
  name: String,
  display: String,
  node_type: NodeType,
  scope: TemplateScope,
  template: String,
  boundary: Option<String>,
}

struct Operation<'a> {
  workflow: &'a Workflow,
  limits: &'a Limits,
  now: DateTime<Utc>,
  spec: WorkflowSpec,
  templates: BTreeMap<String, Template>,
  nodes: Nodes,
  pods: HashMap<&'a str, &'a Pod>,
  results: HashMap<&'a str, &'a TaskResult>,
  renderer: Renderer,
  globals: Scope,
  stopping: Option<Stopping>,
  stopped_any: bool,
  deadline: Option<DateTime<Utc>>,
  /// Leaves with a requested pod that have not finished.
  active: BTreeSet<String>,
  result_refs: BTreeSet<String>,
  actions: Vec<Action>,
  wake: Option<DateTime<Utc>>,
  fatal: Option<String>,
}

impl Operation<'_> {
  fn run(&mut self) -> String {
    let entry = self.spec.entrypoint.clone();
    let root_id = node_id(&self.workflow.metadata, NodeKey::root(&entry));

    let live: Vec<String> = self
      .nodes
      .iter()
      .filter(|n| n.node_type == NodeType::Pod && n.pod_name.is_some() && !n.is_fulfilled())
      .map(|n| n.id.clone())
      .collect();
    self.active.extend(live.iter().cloned());
    for id in &live {
      self.observe_leaf(id);
    }

    if !self.nodes.contains(&root_id) {
      self.create_root(&root_id, &entry);
    }
    self.advance(&root_id);
    root_id
  }

  fn create_root(&mut self, id: &str, entry: &str) {
    let name = self.workflow.name().to_string();
    let template = self.lookup(&TemplateScope::Local, entry);
    let node_type = template
      .as_ref()
      .map(|t| self.node_type_for(t))
      .unwrap_or(NodeType::Pod);
    let mut node = NodeStatus::new(id, &name, &name, node_type);
    node.template_name = entry.to_string();
    self.nodes.insert(node);

    let Some(template) = template else {
      self.fail(id, NodePhase::Error, format!("template '{entry}' not found"));
      return;
    };
    let arguments = match resolve_arguments(&self.renderer, &self.spec.arguments, &self.globals) {
      Ok(arguments) => arguments,
      Err(e) => {
        self.fail(id, NodePhase::Error, e.to_string());
        return;
      }
    };
    match bind_inputs(&template, &arguments) {
      Ok(inputs) => self.bind(id, inputs),
      Err(message) => self.fail(id, NodePhase::Error, message),
    }
  }

  fn advance(&mut self, id: &str) {
    if self.fatal.is_some() {
      return;
    }
    let Some(node) = self.nodes.get(id) else {
      return;
    };
    if node.is_fulfilled() {
      return;
    }
    match node.node_type {
      NodeType::Pod => self.advance_leaf(id),
      NodeType::Retry => self.advance_retry(id),
      NodeType::Dag => self.advance_dag(id),
      NodeType::Steps => self.advance_steps(id),
      NodeType::Suspend => self.advance_suspend(id),
      // Driven by their parents, which hold the call.
      NodeType::StepGroup | NodeType::TaskGroup => {}
    }
  }

  fn advance_dag(&mut self, id: &str) {
    let Some((node, template)) = self.node_and_template(id) else {
      return;
    };
    let Some(dag) = template.dag.clone() else {
      self.fail(id, NodePhase::Error, format!("template '{}' is not a dag", template.name));
      return;
    };
    let graph = match DagGraph::new(&template.name, &dag) {
      Ok(graph) => graph,
      Err(e) => {
        self.fail(id, NodePhase::Error, e.to_string());
        return;
      }
    };
    let order = match graph.topological_order() {
      Ok(order) => order,
      Err(task) => {
        self.fail(id, NodePhase::Error, format!("dependency cycle through task '{task}'"));
        return;
      }
    };
    self.mark_running(id);

    let mut siblings = Siblings::new();
    for task in &dag.tasks {
      let call = Call::from(task);
      let Some(child) = self.placeholder(
        id,
        id,
        &node.template_scope,
        &call,
        NodeKey::child(id, &task.name),
        format!("{}.{}", node.name, task.name),
        task.name.clone(),
      ) else {
        return;
      };
      siblings.insert(task.name.clone(), child);
    }

    let mut scope = self.composite_scope(&node);
    for (name, child) in &siblings {
      self.export(&mut scope, &format!("tasks.{name}"), child);
    }

    for task_name in &order {
      let (Some(task), Some(child)) = (dag.task(task_name), siblings.get(task_name)) else {
        continue;
      };
      let Some(current) = self.nodes.get(child) else {
        continue;
      };
      if current.is_fulfilled() {
        continue;
      }
      let call = Call::from(task);
      let bound = current.inputs.is_some();
      if bound || self.stopping.is_some() {
        self.drive(child, &call, &scope, &node.template_scope, &siblings);
      } else if graph
        .upstream(task_name)
        .iter()
        .all(|u| siblings.get(u).is_some_and(|s| self.is_fulfilled(s)))
      {
        if !self.dependencies_met(&graph, &dag.tasks, task, &siblings) {
          self.omit(child, "omitted: depends condition not met".to_string());
        } else if dag.fail_fast() && self.unhandled_failure(&graph, &dag.tasks, &siblings, false) {
          self.omit(child, "omitted: fail fast".to_string());
        } else {
          self.drive(child, &call, &scope, &node.template_scope, &siblings);
        }
      }
      if self.is_fulfilled(child) {
        self.export(&mut scope, &format!("tasks.{task_name}"), child);
      }
    }

    if self.fatal.is_some() || !siblings.values().all(|c| self.is_fulfilled(c)) {
      return;
    }

    let required: Vec<(String, Option<ContinueOn>)> = dag
      .tasks
      .iter()
      .filter(|t| !self.failure_handled(&graph, &t.name, &siblings, true))
      .filter_map(|t| siblings.get(&t.name).map(|c| (c.clone(), t.continue_on)))
      .collect();
    match self.first_failure(&required) {
      Some((phase, message)) => self.fail(id, phase, message),
      None => self.succeed_composite(id, &template, &scope),
    }
  }

  fn advance_steps(&mut self, id: &str) {
    let Some((node, template)) = self.node_and_template(id) else {
      return;
    };
    let Some(groups) = template.steps.clone() else {
      self.fail(id, NodePhase::Error, format!("template '{}' is not a steps template", template.name));
      return;
    };
    self.mark_running(id);

    let mut scope = self.composite_scope(&node);
    let mut siblings = Siblings::new();
    for (i, group) in groups.iter().enumerate() {
      let label = format!("[{i}]");
      let Some(group_id) = self.ensure_child(
        id,
        NodeKey::child(id, &label),
        NewNode {
          name: format!("{}{label}", node.name),
          display: label.clone(),
          node_type: NodeType::StepGroup,
          scope: node.template_scope.clone(),
          template: String::new(),
          boundary: Some(id.to_string()),
        },
      ) else {
        return;
      };
      let Some(group_node) = self.nodes.get(&group_id).cloned() else {
        return;
      };

      for step in group {
        let call = Call::from(step);
        let Some(child) = self.placeholder(
          &group_id,
          id,
          &node.template_scope,
          &call,
          NodeKey::child(&group_id, &step.name),
          format!("{}.{}", group_node.name, step.name),
          step.name.clone(),
        ) else {
          return;
        };
        siblings.insert(step.name.clone(), child);
      }

      if !group_node.is_fulfilled() {
        self.mark_running(&group_id);
        for step in group {
          let Some(child) = siblings.get(&step.name) else {
            continue;
          };
          if !self.is_fulfilled(child) {
            self.drive(child, &Call::from(step), &scope, &node.template_scope, &siblings);
          }
        }
        if self.fatal.is_some() {
          return;
        }
      }

      let children: Vec<(String, Option<ContinueOn>)> = group
        .iter()
        .filter_map(|s| siblings.get(&s.name).map(|c| (c.clone(), s.continue_on)))
        .collect();
      if !children.iter().all(|(c, _)| self.is_fulfilled(c)) {
        return;
      }
      for step in group {
        if let Some(child) = siblings.get(&step.name) {
          self.export(&mut scope, &format!("steps.{}", step.name), child);
        }
      }
      match self.first_failure(&children) {
        Some((phase, message)) => {
          self.fail(&group_id, phase, message.clone());
          self.fail(id, phase, message);
          return;
        }
        None => self.finish(&group_id, NodePhase::Succeeded, None),
      }
    }

    self.succeed_composite(id, &template, &scope);
  }

  /// Fan a call out over its items.
  fn advance_group(
    &mut self,
    id: &str,
    call: &Call<'_>,
    scope: &Scope,
    caller: &TemplateScope,
    siblings: &Siblings,
  ) {
    let Some(group) = self.nodes.get(id).cloned() else {
      return;
    };
    let items = match iterate::expand(&self.renderer, call.iteration, scope) {
      Ok(items) => items,
      Err(e) => {
        self.fail(id, NodePhase::Error, e.to_string());
        return;
      }
    };
    let Some((template_scope, template_name, template)) = self.resolve_call(caller, call) else {
      self.fail(id, NodePhase::Error, format!("template '{}' not found", call.template));
      return;
    };
    let child_type = self.node_type_for(&template);

    let mut children = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
      let suffix = format!("({i}:{})", iterate::label(item));
      let Some(child) = self.ensure_child(
        id,
        NodeKey::indexed(id, call.name, i),
        NewNode {
          name: format!("{}{suffix}", group.name),
          display: format!("{}{suffix}", call.name),
          node_type: child_type,
          scope: template_scope.clone(),
          template: template_name.clone(),
          boundary: group.boundary_id.clone(),
        },
      ) else {
        return;
      };
      children.push((child.clone(), call.continue_on));

      let Some(node) = self.nodes.get(&child) else {
        continue;
      };
      if node.is_fulfilled() {
        continue;
      }
      if node.inputs.is_some() {
        self.advance(&child);
      } else if let Some(stop) = self.stopping {
        self.stop_unstarted(&child, stop);
      } else {
        let item_scope = scope.with_item(item);
        self.start_call(&child, call, &item_scope, caller, siblings);
      }
    }

    if self.fatal.is_some() || !children.iter().all(|(c, _)| self.is_fulfilled(c)) {
      return;
    }
    match self.first_failure(&children) {
      Some((phase, message)) => self.fail(id, phase, message),
      None => {
        let ids: Vec<String> = children.into_iter().map(|(c, _)| c).collect();
        let outputs = self.aggregate_outputs(&ids);
        if let Some(node) = self.nodes.get_mut(id) {
          node.outputs = outputs;
          node.finish(NodePhase::Succeeded, None, self.now);
        }
      }
    }
  }

  fn advance_retry(&mut self, id: &str) {
    let Some((node, template)) = self.node_and_template(id) else {
      return;
    };
    let mut strategy = template
      .retry_strategy
      .clone()
      .or_else(|| self.spec.retry_strategy.clone())
      .unwrap_or_default();
    let resolved_limit = match &strategy.limit {
      Some(IntOrString::String(limit)) => self
        .renderer
        .substitute(limit, &self.composite_scope(&node))
        .ok(),
      _ => None,
    };
    if let Some(limit) = resolved_limit {
      strategy.limit = Some(IntOrString::String(limit));
    }
    if let Err(limit) = retry::limit(&strategy) {
      tracing::warn!(
        workflow = %self.workflow.key(),
        node = %node.name,
        %limit,
        "invalid retry limit"
      );
      self.fail(id, NodePhase::Error, "invalid retry limit".to_string());
      return;
    }
    self.mark_running(id);

    let attempts = node.children.clone();
    if let Some(last_id) = attempts.last() {
      self.advance(last_id);
      let (Some(last), Some(retry_node)) = (
        self.nodes.get(last_id).cloned(),
        self.nodes.get(id).cloned(),
      ) else {
        return;
      };
      if !last.is_fulfilled() {
        return;
      }
      if last.phase.is_successful() {
        if let Some(n) = self.nodes.get_mut(id) {
          n.outputs = last.outputs.clone();
          n.finish(NodePhase::Succeeded, None, self.now);
        }
        return;
      }
      let stopping = self.stopping.is_some();
      match retry::decide(&strategy, &retry_node, &last, attempts.len(), stopping, self.now) {
        Decision::GiveUp(message) => {
          if let Some(n) = self.nodes.get_mut(id) {
            n.outputs = last.outputs.clone();
            n.finish(last.phase, message, self.now);
          }
          return;
        }
        Decision::Wait(due) => {
          let wait = last
            .finished_at
            .and_then(|f| due.signed_duration_since(f).to_std().ok())
            .unwrap_or_default();
          self.set_message(id, Some(format!("Backoff for {}", format_duration(wait))));
          self.wake(due);
          return;
        }
        Decision::Retry => {}
      }
    } else if let Some(stop) = self.stopping {
      self.stopped_any = true;
      self.fail(id, NodePhase::Failed, stop.cause.to_string());
      return;
    }

    let n = attempts.len();
    let suffix = format!("({n})");
    let Some(child) = self.ensure_child(
      id,
      NodeKey::indexed(id, &node.display_name, n),
      NewNode {
        name: format!("{}{suffix}", node.name),
        display: format!("{}{suffix}", node.display_name),
        node_type: kind_type(&template),
        scope: node.template_scope.clone(),
        template: node.template_name.clone(),
        boundary: node.boundary_id.clone(),
      },
    ) else {
      return;
    };
    if let Some(attempt) = self.nodes.get_mut(&child) {
      attempt.inputs = node.inputs.clone();
    }
    self.set_message(id, None);
    tracing::debug!(workflow = %self.workflow.key(), node = %node.name, attempt = n, "starting attempt");
    self.advance(&child);
  }

  fn advance_suspend(&mut self, id: &str) {
    if let Some(stop) = self.stopping {
      self.stopped_any = true;
      self.fail(id, NodePhase::Failed, stop.cause.to_string());
      return;
    }
    self.mark_running(id);
    let Some((node, template)) = self.node_and_template(id) else {
      return;
    };
    let Some(duration) = template.suspend.and_then(|s| s.duration) else {
      return;
    };
    let parsed = self
      .renderer
      .substitute(&duration, &self.composite_scope(&node))
      .map_err(|e| e.to_string())
      .and_then(|d| parse_duration(&d).map_err(|e| e.to_string()));
    match parsed {
      Err(message) => self.fail(id, NodePhase::Error, message),
      Ok(d) => {
        let started = node.started_at.unwrap_or(self.now);
        let due = chrono::Duration::from_std(d)
          .ok()
          .and_then(|d| started.checked_add_signed(d))
          .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if self.now >= due {
          self.finish(id, NodePhase::Succeeded, None);
        } else {
          self.wake(due);
        }
      }
    }
  }

  fn advance_leaf(&mut self, id: &str) {
    let Some(node) = self.nodes.get(id).cloned() else {
      return;
    };
    if node.pod_name.is_some() {
      self.observe_leaf(id);
      return;
    }
    if let Some(stop) = self.stopping {
      self.stopped_any = true;
      self.fail(id, NodePhase::Failed, stop.cause.to_string());
      return;
    }
    if self.spec.is_suspended() {
      return;
    }
    let Some(template) = self.lookup(&node.template_scope, &node.template_name) else {
      self.fail(id, NodePhase::Error, format!("template '{}' not found", node.template_name));
      return;
    };
    if let Err(e) = template.kind() {
      self.fail(id, NodePhase::Error, e.to_string());
      return;
    }
    let Some(inputs) = node.inputs.clone() else {
      return;
    };
    if self.throttled(&node) {
      self.set_message(id, Some("parallelism limit".to_string()));
      return;
    }

    let mut scope = self.globals.clone();
    input_scope(&mut scope, &inputs, true);
    scope.set("pod.name", id);
    if let Some(attempt) = self.attempt_index(&node) {
      scope.set("retries", attempt.to_string());
    }
    let rendered = match render_leaf(&self.renderer, &template, &inputs, &scope) {
      Ok(rendered) => rendered,
      Err(e) => {
        self.fail(id, NodePhase::Error, e.to_string());
        return;
      }
    };

    let timeout = template
      .active_deadline_seconds
      .and_then(|secs| after(self.now, secs));
    let deadline = match (self.deadline, timeout) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };
    let include_script_output =
      template.script.is_some() || self.result_refs.contains(call_name(&node.display_name));

    tracing::debug!(workflow = %self.workflow.key(), node = %node.name, pod = id, "requesting pod");
    self.actions.push(Action::CreatePod(PodRequest {
      node_id: id.to_string(),
      node_name: node.name.clone(),
      pod_name: id.to_string(),
      template: rendered,
      deadline,
      include_script_output,
    }));
    if let Some(n) = self.nodes.get_mut(id) {
      n.pod_name = Some(id.to_string());
      n.started_at = Some(self.now);
      n.message = None;
    }
    self.active.insert(id.to_string());
    if let Some(t) = timeout {
      self.wake(t);
    }
  }

  /// Fold the pod and task result of a leaf into its status.
  fn observe_leaf(&mut self, id: &str) {
    let Some(node) = self.nodes.get(id).cloned() else {
      return;
    };
    if node.is_fulfilled() || node.pod_name.is_none() {
      return;
    }
    let Some(template) = self.lookup(&node.template_scope, &node.template_name) else {
      self.fail(id, NodePhase::Error, format!("template '{}' not found", node.template_name));
      self.active.remove(id);
      return;
    };
    let pod = self.pods.get(id).copied();

    let timeout = template
      .active_deadline_seconds
      .zip(node.started_at)
      .and_then(|(secs, start)| after(start, secs));
    if let Some(at) = timeout
      && self.now < at
    {
      self.wake(at);
    }
    let cause = match self.stopping {
      Some(stop) if stop.kill_running => Some(stop.cause),
      _ => None,
    }
    .or(timeout.filter(|at| self.now >= *at).map(|_| KillCause::Deadline));

    if let (Some(cause), Some(pod)) = (cause, pod)
      && !pod.status.phase.is_terminal()
      && !pod.metadata.is_deleting()
      && node.message.as_deref() != Some(cause.as_str())
    {
      tracing::info!(workflow = %self.workflow.key(), node = %node.name, %cause, "terminating pod");
      self.actions.push(Action::KillPod {
        node_id: id.to_string(),
        pod_name: pod.metadata.name.clone(),
        cause,
      });
      self.stopped_any = true;
      self.set_message(id, Some(cause.to_string()));
    }

    let result = self.results.get(id).copied();
    match observe(&node, &template, pod, result, self.now, self.limits) {
      Observed::Waiting(due) => {
        if let Some(due) = due {
          self.wake(due);
        }
      }
      Observed::Running => {
        if let Some(n) = self.nodes.get_mut(id) {
          n.transition(NodePhase::Running, self.now);
        }
      }
      Observed::Done {
        phase,
        message,
        outputs,
        resources,
      } => {
        let (phase, message) = match cause {
          Some(cause) if phase.is_failure() => (NodePhase::Failed, Some(cause.to_string())),
          _ => (phase, message),
        };
        if let Some(n) = self.nodes.get_mut(id) {
          n.outputs = outputs;
          n.resources_duration = resources;
          n.finish(phase, message, self.now);
        }
        self.active.remove(id);
      }
    }
  }

  /// Whether starting another pod below `node` would exceed a cap.
  fn throttled(&self, node: &NodeStatus) -> bool {
    let running = self.active.len();
    if self
      .spec
      .parallelism
      .or(self.limits.default_parallelism)
      .is_some_and(|cap| running >= cap)
    {
      return true;
    }
    if self
      .limits
      .namespace_parallelism
      .is_some_and(|cap| self.limits.namespace_active + running >= cap)
    {
      return true;
    }

    let mut ancestor = node.parent_id.clone();
    while let Some(id) = ancestor {
      let Some(a) = self.nodes.get(&id) else {
        break;
      };
      if matches!(a.node_type, NodeType::Dag | NodeType::Steps)
        && let Some(cap) = self
          .lookup(&a.template_scope, &a.template_name)
          .and_then(|t| t.parallelism)
      {
        let below = self
          .active
          .iter()
          .filter(|leaf| self.nodes.is_descendant_of(leaf, &id))
          .count();
        if below >= cap {
          return true;
        }
      }
      ancestor = a.parent_id.clone();
    }
    false
  }

  /// Advance a task or step node that has a placeholder.
  fn drive(
    &mut self,
    id: &str,
    call: &Call<'_>,
    scope: &Scope,
    caller: &TemplateScope,
    siblings: &Siblings,
  ) {
    let Some(node) = self.nodes.get(id) else {
      return;
    };
    if node.is_fulfilled() {
      return;
    }
    let is_group = node.node_type == NodeType::TaskGroup;
    if node.inputs.is_some() {
      if is_group {
        self.advance_group(id, call, scope, caller, siblings);
      } else {
        self.advance(id);
      }
      return;
    }
    if let Some(stop) = self.stopping {
      self.stop_unstarted(id, stop);
      return;
    }
    if is_group {
      if let Err(e) = iterate::expand(&self.renderer, call.iteration, scope) {
        self.unresolved(id, e, siblings);
        return;
      }
      self.bind(id, Inputs::default());
      self.mark_running(id);
      self.advance_group(id, call, scope, caller, siblings);
      return;
    }
    self.start_call(id, call, scope, caller, siblings);
  }

  /// Evaluate `when`, resolve arguments and bind inputs, then advance.
  fn start_call(
    &mut self,
    id: &str,
    call: &Call<'_>,
    scope: &Scope,
    caller: &TemplateScope,
    siblings: &Siblings,
  ) {
    if let Some(condition) = call.when {
      match self.condition(condition, scope) {
        Ok((true, _)) => {}
        Ok((false, text)) => {
          self.finish(id, NodePhase::Skipped, Some(format!("when '{text}' evaluated false")));
          return;
        }
        Err(e) => {
          self.unresolved(id, e, siblings);
          return;
        }
      }
    }
    let arguments = match resolve_arguments(&self.renderer, call.arguments, scope) {
      Ok(arguments) => arguments,
      Err(e) => {
        self.unresolved(id, e, siblings);
        return;
      }
    };
    let Some((_, _, template)) = self.resolve_call(caller, call) else {
      self.fail(id, NodePhase::Error, format!("template '{}' not found", call.template));
      return;
    };
    match bind_inputs(&template, &arguments) {
      Ok(inputs) => {
        self.bind(id, inputs);
        self.set_message(id, None);
      }
      Err(message) => {
        self.fail(id, NodePhase::Error, message);
        return;
      }
    }
    self.advance(id);
  }

  fn condition(&self, text: &str, scope: &Scope) -> Result<(bool, String), Unresolved> {
    let substituted = self.renderer.substitute(text, scope)?;
    match when::evaluate(&self.renderer, &substituted) {
      Ok(value) => Ok((value, substituted)),
      Err(reason) => Err(Unresolved::Invalid {
        expression: text.to_string(),
        reason,
      }),
    }
  }

  /// A reference that did not resolve: wait on a producer that has not
  /// finished, omit behind one that failed, error otherwise.
  fn unresolved(&mut self, id: &str, error: Unresolved, siblings: &Siblings) {
    let producer = error
      .producer()
      .and_then(|p| siblings.get(p).map(|sid| (p, sid)))
      .and_then(|(p, sid)| self.nodes.get(sid).map(|n| (p.to_string(), n.phase)));
    match producer {
      Some((name, phase)) if !phase.is_fulfilled() => {
        self.set_message(id, Some(format!("waiting on `{name}`")));
      }
      Some((name, phase)) if !phase.is_successful() => {
        self.omit(id, format!("omitted: `{name}` did not succeed"));
      }
      _ => self.fail(id, NodePhase::Error, error.to_string()),
    }
  }

  fn dependencies_met(
    &self,
    graph: &DagGraph,
    tasks: &[DagTask],
    task: &DagTask,
    siblings: &Siblings,
  ) -> bool {
    if let Some(expr) = graph.depends(&task.name) {
      return expr.evaluate(&|name, qualifier| self.holds(siblings, name, qualifier));
    }
    graph.upstream(&task.name).iter().all(|upstream| {
      let Some(phase) = siblings
        .get(upstream)
        .and_then(|id| self.nodes.get(id))
        .map(|n| n.phase)
      else {
        return false;
      };
      let continue_on = tasks
        .iter()
        .find(|t| &t.name == upstream)
        .and_then(|t| t.continue_on);
      phase.is_successful() || tolerates(continue_on, phase)
    })
  }

  fn holds(&self, siblings: &Siblings, name: &str, qualifier: Option<Qualifier>) -> bool {
    let Some(node) = siblings.get(name).and_then(|id| self.nodes.get(id)) else {
      return false;
    };
    let children: Vec<NodePhase> = self.nodes.children(&node.id).iter().map(|c| c.phase).collect();
    Qualifier::holds(qualifier, node.phase, &children)
  }

  /// Whether a failed task's failure is part of the flow: tolerated by
  /// `continueOn` or reacted to by a downstream `depends`. With `ran`, the
  /// reacting task must not have been omitted.
  fn failure_handled(&self, graph: &DagGraph, task: &str, siblings: &Siblings, ran: bool) -> bool {
    graph.downstream(task).iter().any(|d| {
      graph.depends(d).is_some_and(|e| e.handles_failure_of(task))
        && (!ran
          || siblings
            .get(d)
            .and_then(|id| self.nodes.get(id))
            .is_some_and(|n| n.phase != NodePhase::Omitted))
    })
  }

  fn unhandled_failure(
    &self,
    graph: &DagGraph,
    tasks: &[DagTask],
    siblings: &Siblings,
    ran: bool,
  ) -> bool {
    tasks.iter().any(|t| {
      siblings
        .get(&t.name)
        .and_then(|id| self.nodes.get(id))
        .is_some_and(|n| {
          n.phase.is_failure()
            && !tolerates(t.continue_on, n.phase)
            && !self.failure_handled(graph, &t.name, siblings, ran)
        })
    })
  }

  /// The failure a composite inherits from its children; `Failed` wins over
  /// `Error`.
  fn first_failure(&self, children: &[(String, Option<ContinueOn>)]) -> Option<(NodePhase, String)> {
    let mut found: Option<(NodePhase, String)> = None;
    for (id, continue_on) in children {
      let Some(child) = self.nodes.get(id) else {
        continue;
      };
      if !child.phase.is_failure() || tolerates(*continue_on, child.phase) {
        continue;
      }
      let message = child
        .message
        .clone()
        .unwrap_or_else(|| format!("child '{}' {}", child.display_name, child.phase));
      match &found {
        None => found = Some((child.phase, message)),
        Some((NodePhase::Error, _)) if child.phase == NodePhase::Failed => {
          found = Some((child.phase, message));
        }
        _ => {}
      }
    }
    found
  }

  fn succeed_composite(&mut self, id: &str, template: &Template, scope: &Scope) {
    match self.composite_outputs(template, scope) {
      Ok(outputs) => {
        if let Some(node) = self.nodes.get_mut(id) {
          node.outputs = outputs;
          node.finish(NodePhase::Succeeded, None, self.now);
        }
      }
      Err(message) => self.fail(id, NodePhase::Error, message),
    }
  }

  fn composite_outputs(&self, template: &Template, scope: &Scope) -> Result<Option<Outputs>, String> {
    if template.outputs.parameters.is_empty() && template.outputs.artifacts.is_empty() {
      return Ok(None);
    }
    let mut outputs = Outputs::default();
    for declared in &template.outputs.parameters {
      let value_from = declared.value_from.as_ref();
      let source = value_from
        .and_then(|v| v.parameter.as_deref())
        .or(declared.value.as_deref());
      let fallback = value_from
        .and_then(|v| v.default.clone())
        .or_else(|| declared.default.clone());
      let value = match source.map(|s| self.renderer.substitute(s, scope)) {
        Some(Ok(value)) => value,
        Some(Err(e)) => fallback.ok_or_else(|| {
          format!("unable to resolve outputs.parameters.{}: {e}", declared.name)
        })?,
        None => fallback
          .ok_or_else(|| format!("outputs.parameters.{} has no value", declared.name))?,
      };
      outputs.parameters.push(Parameter::new(&declared.name, value));
    }
    for declared in &template.outputs.artifacts {
      let key = match &declared.from {
        Some(from) => Some(self.renderer.substitute(from, scope).map_err(|e| {
          format!("unable to resolve outputs.artifacts.{}: {e}", declared.name)
        })?),
        None => None,
      };
      if key.is_none() && !declared.optional {
        return Err(format!("outputs.artifacts.{} has no source", declared.name));
      }
      outputs.artifacts.push(Artifact {
        name: declared.name.clone(),
        key,
        optional: declared.optional,
        ..Default::default()
      });
    }
    Ok(Some(outputs))
  }

  /// Outputs of a task group: each parameter and the result as a JSON list
  /// over the iterations.
  fn aggregate_outputs(&self, children: &[String]) -> Option<Outputs> {
    let nodes: Vec<&NodeStatus> = children.iter().filter_map(|c| self.nodes.get(c)).collect();
    let mut names: Vec<String> = Vec::new();
    for node in &nodes {
      for param in node.outputs.iter().flat_map(|o| &o.parameters) {
        if !names.contains(&param.name) {
          names.push(param.name.clone());
        }
      }
    }

    let mut outputs = Outputs::default();
    for name in names {
      let values: Vec<Value> = nodes
        .iter()
        .map(|n| {
          n.outputs
            .as_ref()
            .and_then(|o| o.parameter(&name))
            .and_then(|p| p.value.clone())
            .map_or(Value::Null, Value::String)
        })
        .collect();
      outputs
        .parameters
        .push(Parameter::new(name, Value::Array(values).to_string()));
    }
    if nodes
      .iter()
      .any(|n| n.outputs.as_ref().is_some_and(|o| o.result.is_some()))
    {
      let results: Vec<Value> = nodes
        .iter()
        .map(|n| {
          n.outputs
            .as_ref()
            .and_then(|o| o.result.clone())
            .map_or(Value::Null, Value::String)
        })
        .collect();
      outputs.result = Some(Value::Array(results).to_string());
    }
    (!outputs.is_empty()).then_some(outputs)
  }

  /// Make a finished node's identity and outputs visible as `prefix.*`.
  fn export(&self, scope: &mut Scope, prefix: &str, id: &str) {
    let Some(node) = self.nodes.get(id) else {
      return;
    };
    if !node.is_fulfilled() {
      return;
    }
    scope.set(format!("{prefix}.id"), &node.id);
    scope.set(format!("{prefix}.status"), node.phase.as_str());
    if let Some(at) = node.started_at {
      scope.set(format!("{prefix}.startedAt"), at.to_rfc3339());
    }
    if let Some(at) = node.finished_at {
      scope.set(format!("{prefix}.finishedAt"), at.to_rfc3339());
    }
    if let Some(outputs) = &node.outputs {
      for param in &outputs.parameters {
        if let Some(value) = &param.value {
          scope.set(format!("{prefix}.outputs.parameters.{}", param.name), value);
        }
      }
      for artifact in &outputs.artifacts {
        if let Some(key) = &artifact.key {
          scope.set(format!("{prefix}.outputs.artifacts.{}", artifact.name), key);
        }
      }
      if let Some(result) = &outputs.result {
        scope.set(format!("{prefix}.outputs.result"), result);
      }
      if let Some(code) = outputs.exit_code {
        scope.set(format!("{prefix}.exitCode"), code.to_string());
      }
    }
    if node.node_type == NodeType::TaskGroup {
      let per_item: Vec<Value> = self
        .nodes
        .children(id)
        .iter()
        .map(|child| {
          let fields: Map<String, Value> = child
            .outputs
            .iter()
            .flat_map(|o| &o.parameters)
            .filter_map(|p| p.value.clone().map(|v| (p.name.clone(), Value::String(v))))
            .collect();
          Value::Object(fields)
        })
        .collect();
      scope.set(format!("{prefix}.outputs.parameters"), Value::Array(per_item).to_string());
    }
  }

  fn composite_scope(&self, node: &NodeStatus) -> Scope {
    let mut scope = self.globals.clone();
    if let Some(inputs) = &node.inputs {
      input_scope(&mut scope, inputs, false);
    }
    scope
  }

  /// The node for a task or step, created on first sight with its inputs
  /// still unbound.
  #[allow(clippy::too_many_arguments)]
  fn placeholder(
    &mut self,
    parent: &str,
    boundary: &str,
    caller: &TemplateScope,
    call: &Call<'_>,
    key: NodeKey<'_>,
    name: String,
    display: String,
  ) -> Option<String> {
    let (node_type, scope, template) = match self.resolve_call(caller, call) {
      Some((scope, template_name, template)) => {
        let node_type = if call.iteration.is_set() {
          NodeType::TaskGroup
        } else {
          self.node_type_for(&template)
        };
        (node_type, scope, template_name)
      }
      None => (NodeType::Pod, caller.clone(), call.template.to_string()),
    };
    self.ensure_child(
      parent,
      key,
      NewNode {
        name,
        display,
        node_type,
        scope,
        template,
        boundary: Some(boundary.to_string()),
      },
    )
  }

  /// Create the child if it does not exist yet and link it under `parent`.
  /// Returns `None` after recording a fatal id collision.
  fn ensure_child(&mut self, parent: &str, key: NodeKey<'_>, child: NewNode) -> Option<String> {
    let id = node_id(&self.workflow.metadata, key);
    match self.nodes.get(&id) {
      Some(existing) if existing.name == child.name => {}
      Some(existing) => {
        self.fatal = Some(format!(
          "node id collision: '{}' and '{}' both derive {id}",
          existing.name, child.name
        ));
        return None;
      }
      None => {
        let mut node = NodeStatus::new(&id, child.name, child.display, child.node_type);
        node.parent_id = Some(parent.to_string());
        node.boundary_id = child.boundary;
        node.template_name = child.template;
        node.template_scope = child.scope;
        self.nodes.insert(node);
      }
    }
    self.nodes.link(parent, &id);
    Some(id)
  }

  fn node_type_for(&self, template: &Template) -> NodeType {
    let leaf = template.is_leaf();
    if template.retry_strategy.is_some() || (leaf && self.spec.retry_strategy.is_some()) {
      NodeType::Retry
    } else {
      kind_type(template)
    }
  }

  fn resolve_call(
    &self,
    caller: &TemplateScope,
    call: &Call<'_>,
  ) -> Option<(TemplateScope, String, Template)> {
    let (scope, name) = match call.template_ref {
      Some(r) => (TemplateScope::from_ref(r), r.template.clone()),
      None => (caller.clone(), call.template.to_string()),
    };
    let template = self.lookup(&scope, &name)?;
    Some((scope, name, template))
  }

  fn lookup(&self, scope: &TemplateScope, name: &str) -> Option<Template> {
    self
      .templates
      .get(&stored_template_key(scope, name))
      .cloned()
  }

  fn node_and_template(&mut self, id: &str) -> Option<(NodeStatus, Template)> {
    let node = self.nodes.get(id)?.clone();
    match self.lookup(&node.template_scope, &node.template_name) {
      Some(template) => Some((node, template)),
      None => {
        self.fail(id, NodePhase::Error, format!("template '{}' not found", node.template_name));
        None
      }
    }
  }

  /// Position of an attempt under its retry node.
  fn attempt_index(&self, node: &NodeStatus) -> Option<usize> {
    let parent = self.nodes.get(node.parent_id.as_deref()?)?;
    if parent.node_type != NodeType::Retry {
      return None;
    }
    parent.children.iter().position(|c| *c == node.id)
  }

  fn is_fulfilled(&self, id: &str) -> bool {
    self.nodes.get(id).is_some_and(NodeStatus::is_fulfilled)
  }

  fn bind(&mut self, id: &str, inputs: Inputs) {
    if let Some(node) = self.nodes.get_mut(id) {
      node.inputs = Some(inputs);
    }
  }

  fn mark_running(&mut self, id: &str) {
    if let Some(node) = self.nodes.get_mut(id) {
      node.transition(NodePhase::Running, self.now);
    }
  }

  fn set_message(&mut self, id: &str, message: Option<String>) {
    if let Some(node) = self.nodes.get_mut(id) {
      node.message = message;
    }
  }

  fn finish(&mut self, id: &str, phase: NodePhase, message: Option<String>) {
    if let Some(node) = self.nodes.get_mut(id) {
      node.finish(phase, message, self.now);
    }
  }

  fn fail(&mut self, id: &str, phase: NodePhase, message: String) {
    self.finish(id, phase, Some(message));
  }

  fn omit(&mut self, id: &str, message: String) {
    self.finish(id, NodePhase::Omitted, Some(message));
  }

  fn stop_unstarted(&mut self, id: &str, stop: Stopping) {
    self.stopped_any = true;
    self.omit(id, stop.cause.to_string());
  }

  fn wake(&mut self, at: DateTime<Utc>) {
    self.wake = Some(self.wake.map_or(at, |w| w.min(at)));
  }
}
