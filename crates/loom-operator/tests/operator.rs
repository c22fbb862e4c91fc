//! Drives `operate` pass by pass against a hand-rolled cluster: pods are
//! created from the returned actions and moved through their phases by the
//! tests, task results are written the way the agent would.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use loom_cluster::{ContainerState, Pod, PodPhase, TaskResult};
use loom_config::{ObjectMeta, Outputs, Parameter, ShutdownStrategy, WorkflowSpec};
use loom_operator::{Action, KillCause, Limits, Outcome, PodRequest, Snapshot, operate};
use loom_workflow::contract::{LABEL_COMPLETED, LABEL_NODE_ID, LABEL_WORKFLOW, MAIN_CONTAINER};
use loom_workflow::{
  NodePhase, NodeStatus, NodeType, TemplateScope, Workflow, WorkflowPhase, resume_workflow,
};

struct Harness {
  workflow: Workflow,
  pods: Vec<Pod>,
  results: Vec<TaskResult>,
  libraries: BTreeMap<TemplateScope, WorkflowSpec>,
  limits: Limits,
  now: DateTime<Utc>,
  requests: Vec<PodRequest>,
  kills: Vec<(String, KillCause)>,
}

impl Harness {
  fn new(manifest: &str) -> Self {
    let spec: WorkflowSpec = serde_yaml::from_str(manifest).expect("manifest parses");
    Self {
      workflow: Workflow::new("default", "wf", spec),
      pods: Vec::new(),
      results: Vec::new(),
      libraries: BTreeMap::new(),
      limits: Limits::default(),
      now: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
      requests: Vec::new(),
      kills: Vec::new(),
    }
  }

  fn step(&mut self) -> Outcome {
    let outcome = operate(&Snapshot {
      workflow: &self.workflow,
      pods: &self.pods,
      results: &self.results,
      libraries: &self.libraries,
      now: self.now,
      limits: &self.limits,
    });
    self.workflow.status = outcome.status.clone();
    for action in &outcome.actions {
      match action {
        Action::CreatePod(request) => {
          if self.pods.iter().all(|p| p.metadata.name != request.pod_name) {
            self.pods.push(Pod {
              metadata: ObjectMeta::new("default", &request.pod_name)
                .with_label(LABEL_NODE_ID, &request.node_id)
                .with_label(LABEL_WORKFLOW, "wf")
                .with_label(LABEL_COMPLETED, "false"),
              ..Default::default()
            });
            self.requests.push(request.clone());
          }
        }
        Action::KillPod {
          pod_name, cause, ..
        } => self.kills.push((pod_name.clone(), *cause)),
        Action::MarkCompleted { pod_name } => {
          if let Some(pod) = self.pods.iter_mut().find(|p| &p.metadata.name == pod_name) {
            pod
              .metadata
              .labels
              .insert(LABEL_COMPLETED.to_string(), "true".to_string());
          }
        }
      }
    }
    outcome
  }

  fn tick(&mut self, secs: i64) {
    self.now += chrono::Duration::seconds(secs);
  }

  fn node(&self, name: &str) -> &NodeStatus {
    self
      .workflow
      .status
      .nodes
      .by_name(name)
      .unwrap_or_else(|| panic!("no node named {name}"))
  }

  fn phase(&self, name: &str) -> NodePhase {
    self.node(name).phase
  }

  fn pod_mut(&mut self, node: &str) -> &mut Pod {
    let id = self.node(node).id.clone();
    self
      .pods
      .iter_mut()
      .find(|p| p.metadata.name == id)
      .unwrap_or_else(|| panic!("no pod for {node}"))
  }

  fn has_pod(&self, node: &str) -> bool {
    let id = &self.node(node).id;
    self.pods.iter().any(|p| &p.metadata.name == id)
  }

  fn start(&mut self, node: &str) {
    let now = self.now;
    let pod = self.pod_mut(node);
    pod.status.phase = PodPhase::Running;
    pod.status.start_time = Some(now);
    pod.set_container_state(MAIN_CONTAINER, ContainerState::Running { started_at: Some(now) });
  }

  fn exit(&mut self, node: &str, code: i32, outputs: Outputs) {
    let now = self.now;
    let id = self.node(node).id.clone();
    let pod = self.pod_mut(node);
    let started_at = pod.status.start_time;
    pod.status.phase = if code == 0 {
      PodPhase::Succeeded
    } else {
      PodPhase::Failed
    };
    pod.set_container_state(
      MAIN_CONTAINER,
      ContainerState::Terminated {
        exit_code: code,
        reason: None,
        message: None,
        started_at,
        finished_at: Some(now),
      },
    );
    self.results.push(TaskResult {
      metadata: ObjectMeta::new("default", id).with_label(LABEL_WORKFLOW, "wf"),
      outputs,
      ..Default::default()
    });
  }

  fn run(&mut self, node: &str, code: i32) {
    self.start(node);
    self.exit(node, code, Outputs::default());
  }

  fn running_leaves(&self) -> usize {
    self
      .workflow
      .status
      .nodes
      .iter()
      .filter(|n| n.node_type == NodeType::Pod && n.pod_name.is_some() && !n.is_fulfilled())
      .count()
  }
}

fn with_param(name: &str, value: &str) -> Outputs {
  Outputs {
    parameters: vec![Parameter::new(name, value)],
    ..Default::default()
  }
}

#[test]
fn test_single_container_success() {
  let mut h = Harness::new(
    r#"
entrypoint: hello
templates:
  - name: hello
    container:
      image: alpine
      command: [echo, hello]
"#,
  );

  let first = h.step();
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Running);
  assert_eq!(h.requests.len(), 1);
  assert!(first.actions.iter().any(|a| matches!(a, Action::CreatePod(_))));
  assert_eq!(h.phase("wf"), NodePhase::Pending);

  h.tick(1);
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Pending);

  h.start("wf");
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Running);

  h.tick(1);
  h.exit("wf", 0, Outputs::default());
  let last = h.step();
  assert_eq!(h.phase("wf"), NodePhase::Succeeded);
  assert_eq!(h.node("wf").exit_code(), Some(0));
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
  assert!(h.workflow.status.finished_at.is_some());
  assert!(
    last
      .actions
      .iter()
      .any(|a| matches!(a, Action::MarkCompleted { .. }))
  );
  assert_eq!(h.requests.len(), 1);
}

#[test]
fn test_operate_is_idempotent() {
  let mut h = Harness::new(
    r#"
entrypoint: hello
templates:
  - name: hello
    container:
      image: alpine
"#,
  );
  h.step();
  let snapshot = Snapshot {
    workflow: &h.workflow,
    pods: &h.pods,
    results: &h.results,
    libraries: &h.libraries,
    now: h.now,
    limits: &h.limits,
  };
  let a = operate(&snapshot);
  let b = operate(&snapshot);
  assert_eq!(a.status, b.status);
  assert_eq!(a.actions, b.actions);
}

const DIAMOND: &str = r#"
entrypoint: main
templates:
  - name: main
    dag:
      tasks:
        - name: A
          template: ok
        - name: B
          template: flaky
          dependencies: [A]
        - name: C
          template: ok
          dependencies: [A]
        - name: D
          template: ok
          dependencies: [B, C]
  - name: ok
    container:
      image: alpine
  - name: flaky
    retryStrategy:
      limit: 0
    container:
      image: alpine
      command: [sh, -c, "exit 1"]
"#;

#[test]
fn test_diamond_with_failed_branch() {
  let mut h = Harness::new(DIAMOND);
  h.step();
  assert_eq!(h.requests.len(), 1);
  assert_eq!(h.node("wf").node_type, NodeType::Dag);

  h.run("wf.A", 0);
  h.step();
  assert_eq!(h.phase("wf.A"), NodePhase::Succeeded);
  assert_eq!(h.node("wf.B").node_type, NodeType::Retry);
  assert!(h.has_pod("wf.B(0)"));
  assert!(h.has_pod("wf.C"));

  h.tick(2);
  h.run("wf.B(0)", 1);
  h.start("wf.C");
  h.step();
  assert_eq!(h.phase("wf.B"), NodePhase::Failed);
  assert_eq!(h.node("wf.B").message.as_deref(), Some("Error (exit code 1)"));
  assert_eq!(h.phase("wf.D"), NodePhase::Pending);
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Running);

  h.tick(1);
  h.exit("wf.C", 0, Outputs::default());
  h.step();
  assert_eq!(h.phase("wf.C"), NodePhase::Succeeded);
  assert_eq!(h.phase("wf.D"), NodePhase::Omitted);
  assert!(!h.has_pod("wf.D"));
  assert_eq!(h.phase("wf"), NodePhase::Failed);
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
  assert_eq!(h.requests.len(), 3);
}

#[test]
fn test_depends_reacts_to_failure() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    dag:
      tasks:
        - name: build
          template: work
        - name: cleanup
          template: work
          depends: build.Failed
        - name: publish
          template: work
          depends: build.Succeeded
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.run("wf.build", 2);
  h.step();
  assert_eq!(h.phase("wf.build"), NodePhase::Failed);
  assert_eq!(h.phase("wf.publish"), NodePhase::Omitted);
  assert!(h.has_pod("wf.cleanup"));

  h.run("wf.cleanup", 0);
  h.step();
  assert_eq!(h.phase("wf.cleanup"), NodePhase::Succeeded);
  // build's failure was handled by cleanup
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
}

#[test]
fn test_retry_backoff() {
  let mut h = Harness::new(
    r#"
entrypoint: flaky
templates:
  - name: flaky
    retryStrategy:
      limit: 2
      backoff:
        duration: 1s
        factor: 2
    container:
      image: alpine
"#,
  );
  h.step();
  assert_eq!(h.node("wf").node_type, NodeType::Retry);
  assert!(h.has_pod("wf(0)"));

  h.run("wf(0)", 1);
  let waiting = h.step();
  assert_eq!(h.phase("wf(0)"), NodePhase::Failed);
  assert_eq!(h.node("wf").message.as_deref(), Some("Backoff for 1s"));
  assert_eq!(waiting.requeue_after, Some(Duration::from_secs(1)));
  assert_eq!(h.requests.len(), 1);

  // Same message on a second pass before the backoff elapsed.
  h.step();
  assert_eq!(h.node("wf").message.as_deref(), Some("Backoff for 1s"));
  assert_eq!(h.requests.len(), 1);

  h.tick(1);
  h.step();
  assert_eq!(h.requests.len(), 2);
  assert!(h.has_pod("wf(1)"));
  assert_eq!(h.node("wf").message, None);

  h.tick(1);
  h.run("wf(1)", 1);
  h.step();
  assert_eq!(h.node("wf").message.as_deref(), Some("Backoff for 2s"));

  h.tick(1);
  h.step();
  assert_eq!(h.requests.len(), 2);

  h.tick(1);
  h.step();
  assert_eq!(h.requests.len(), 3);

  h.run("wf(2)", 0);
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Succeeded);
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
  assert_eq!(h.node("wf").children.len(), 3);
}

#[test]
fn test_unparseable_retry_limit_errors() {
  let mut h = Harness::new(
    r#"
entrypoint: flaky
arguments:
  parameters:
    - name: tries
      value: lots
templates:
  - name: flaky
    retryStrategy:
      limit: "{{workflow.parameters.tries}}"
    container:
      image: alpine
"#,
  );
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Error);
  assert_eq!(h.node("wf").message.as_deref(), Some("invalid retry limit"));
  assert!(h.requests.is_empty());
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Error);
}

#[test]
fn test_parallelism_cap() {
  let mut h = Harness::new(
    r#"
entrypoint: main
parallelism: 2
templates:
  - name: main
    dag:
      tasks:
        - { name: t1, template: work }
        - { name: t2, template: work }
        - { name: t3, template: work }
        - { name: t4, template: work }
        - { name: t5, template: work }
  - name: work
    container:
      image: alpine
"#,
  );
  let names = ["wf.t1", "wf.t2", "wf.t3", "wf.t4", "wf.t5"];
  h.step();
  assert_eq!(h.requests.len(), 2);

  for _ in 0..10 {
    assert!(h.running_leaves() <= 2);
    let live: Vec<&str> = names
      .iter()
      .copied()
      .filter(|n| h.has_pod(n) && !h.node(n).is_fulfilled())
      .collect();
    for name in live {
      h.run(name, 0);
    }
    h.tick(1);
    h.step();
    if h.workflow.status.phase.is_completed() {
      break;
    }
  }

  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
  assert_eq!(h.requests.len(), 5);
}

#[test]
fn test_throttled_leaf_reports_parallelism() {
  let mut h = Harness::new(
    r#"
entrypoint: main
parallelism: 1
templates:
  - name: main
    steps:
      - - { name: a, template: work }
        - { name: b, template: work }
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  assert_eq!(h.requests.len(), 1);
  let waiting = if h.has_pod("wf[0].a") { "wf[0].b" } else { "wf[0].a" };
  assert_eq!(h.node(waiting).message.as_deref(), Some("parallelism limit"));
  assert_eq!(h.phase(waiting), NodePhase::Pending);
}

#[test]
fn test_active_deadline_kills_running_pod() {
  let mut h = Harness::new(
    r#"
entrypoint: sleep
activeDeadlineSeconds: 5
templates:
  - name: sleep
    container:
      image: alpine
      command: [sleep, "60"]
"#,
  );
  let first = h.step();
  assert_eq!(first.requeue_after, Some(Duration::from_secs(5)));
  assert_eq!(h.requests[0].deadline, Some(h.now + chrono::Duration::seconds(5)));
  h.start("wf");
  h.tick(1);
  h.step();

  h.tick(5);
  h.step();
  assert_eq!(h.kills.len(), 1);
  assert_eq!(h.kills[0].1, KillCause::Deadline);
  assert_eq!(h.phase("wf"), NodePhase::Running);

  // A second pass must not kill again.
  h.step();
  assert_eq!(h.kills.len(), 1);

  h.exit("wf", 143, Outputs::default());
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Failed);
  assert_eq!(h.node("wf").message.as_deref(), Some("deadline"));
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
  assert_eq!(h.workflow.status.message.as_deref(), Some("deadline"));
}

#[test]
fn test_output_parameter_flows_to_consumer() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    dag:
      tasks:
        - name: produce
          template: produce
        - name: consume
          template: consume
          dependencies: [produce]
          arguments:
            parameters:
              - name: msg
                value: "{{tasks.produce.outputs.parameters.msg}}"
  - name: produce
    outputs:
      parameters:
        - name: msg
          valueFrom:
            path: /tmp/msg
    container:
      image: alpine
  - name: consume
    inputs:
      parameters:
        - name: msg
    container:
      image: alpine
      args: ["{{inputs.parameters.msg}}"]
"#,
  );
  h.step();
  h.start("wf.produce");
  h.exit("wf.produce", 0, with_param("msg", "hello"));
  h.step();

  let request = h
    .requests
    .iter()
    .find(|r| r.node_name == "wf.consume")
    .expect("consume requested");
  let container = request.template.container.as_ref().expect("container");
  assert_eq!(container.args, vec!["hello".to_string()]);
  assert_eq!(
    request.template.inputs.parameter("msg").and_then(|p| p.value.as_deref()),
    Some("hello")
  );
}

#[test]
fn test_when_false_skips_step() {
  let mut h = Harness::new(
    r#"
entrypoint: main
arguments:
  parameters:
    - name: coin
      value: tails
templates:
  - name: main
    steps:
      - - name: heads
          template: work
          when: "{{workflow.parameters.coin}} == heads"
        - name: tails
          template: work
          when: "{{workflow.parameters.coin}} == tails"
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  assert_eq!(h.phase("wf[0].heads"), NodePhase::Skipped);
  assert_eq!(
    h.node("wf[0].heads").message.as_deref(),
    Some("when 'tails == heads' evaluated false")
  );
  assert!(h.has_pod("wf[0].tails"));

  h.run("wf[0].tails", 0);
  h.step();
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
}

#[test]
fn test_with_items_fans_out() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    dag:
      tasks:
        - name: fan
          template: echo
          withItems: [a, b, c]
          arguments:
            parameters:
              - name: word
                value: "{{item}}"
  - name: echo
    inputs:
      parameters:
        - name: word
    container:
      image: alpine
      args: ["{{inputs.parameters.word}}"]
"#,
  );
  h.step();
  assert_eq!(h.node("wf.fan").node_type, NodeType::TaskGroup);
  assert_eq!(h.requests.len(), 3);
  let args: Vec<String> = h
    .requests
    .iter()
    .filter_map(|r| r.template.container.as_ref())
    .flat_map(|c| c.args.clone())
    .collect();
  assert_eq!(args, vec!["a", "b", "c"]);

  for name in ["wf.fan(0:a)", "wf.fan(1:b)", "wf.fan(2:c)"] {
    h.run(name, 0);
  }
  h.step();
  assert_eq!(h.phase("wf.fan"), NodePhase::Succeeded);
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Succeeded);
}

#[test]
fn test_invalid_workflow_errors() {
  let mut h = Harness::new(
    r#"
entrypoint: missing
templates:
  - name: hello
    container:
      image: alpine
"#,
  );
  let outcome = h.step();
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Error);
  assert!(h.workflow.status.message.is_some());
  assert!(outcome.actions.is_empty());
  assert!(h.workflow.status.nodes.is_empty());
}

#[test]
fn test_stop_lets_running_pods_finish() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - { name: first, template: work }
      - - { name: second, template: work }
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.start("wf[0].first");
  h.workflow.spec.shutdown = Some(ShutdownStrategy::Stop);
  h.step();
  assert!(h.kills.is_empty());
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Running);

  h.exit("wf[0].first", 0, Outputs::default());
  h.step();
  assert_eq!(h.phase("wf[0].first"), NodePhase::Succeeded);
  assert_eq!(h.phase("wf[1].second"), NodePhase::Omitted);
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Failed);
  assert_eq!(h.workflow.status.message.as_deref(), Some("cancelled"));
  assert_eq!(h.requests.len(), 1);
}

#[test]
fn test_terminate_kills_running_pods() {
  let mut h = Harness::new(
    r#"
entrypoint: work
templates:
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.start("wf");
  h.workflow.spec.shutdown = Some(ShutdownStrategy::Terminate);
  h.step();
  assert_eq!(h.kills.len(), 1);
  assert_eq!(h.kills[0].1, KillCause::Cancelled);
}

#[test]
fn test_missing_pod_errors_after_grace() {
  let mut h = Harness::new(
    r#"
entrypoint: work
templates:
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.pods.clear();
  h.tick(5);
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Pending);

  h.tick(10);
  h.step();
  assert_eq!(h.phase("wf"), NodePhase::Error);
  assert_eq!(h.node("wf").message.as_deref(), Some("pod deleted"));
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Error);
}

#[test]
fn test_timed_suspend_wakes_then_continues() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - { name: pause, template: pause }
      - - { name: after, template: work }
  - name: pause
    suspend:
      duration: 10s
  - name: work
    container:
      image: alpine
"#,
  );
  let waiting = h.step();
  assert_eq!(h.node("wf[0].pause").node_type, NodeType::Suspend);
  assert_eq!(h.phase("wf[0].pause"), NodePhase::Running);
  assert_eq!(waiting.requeue_after, Some(Duration::from_secs(10)));
  assert!(h.requests.is_empty());

  h.tick(4);
  let waiting = h.step();
  assert_eq!(h.phase("wf[0].pause"), NodePhase::Running);
  assert_eq!(waiting.requeue_after, Some(Duration::from_secs(6)));

  h.tick(6);
  h.step();
  assert_eq!(h.phase("wf[0].pause"), NodePhase::Succeeded);
  assert!(h.has_pod("wf[1].after"));
  assert_eq!(h.requests.len(), 1);
}

#[test]
fn test_suspended_workflow_observes_but_creates_nothing() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - { name: first, template: work }
      - - { name: second, template: work }
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.start("wf[0].first");
  h.workflow.spec.suspend = Some(true);
  h.step();
  assert!(h.kills.is_empty());

  h.exit("wf[0].first", 0, Outputs::default());
  h.step();
  assert_eq!(h.phase("wf[0].first"), NodePhase::Succeeded);
  assert_eq!(h.requests.len(), 1);
  assert!(
    h.workflow
      .status
      .nodes
      .by_name("wf[1].second")
      .is_none_or(|n| n.pod_name.is_none())
  );
  assert_eq!(h.workflow.status.phase, WorkflowPhase::Running);

  assert!(resume_workflow(&mut h.workflow, h.now));
  h.step();
  assert_eq!(h.requests.len(), 2);
  assert!(h.has_pod("wf[1].second"));
}

#[test]
fn test_indefinite_suspend_waits_for_resume() {
  let mut h = Harness::new(
    r#"
entrypoint: main
templates:
  - name: main
    steps:
      - - { name: approve, template: approve }
      - - { name: after, template: work }
  - name: approve
    suspend: {}
  - name: work
    container:
      image: alpine
"#,
  );
  h.step();
  h.tick(3600);
  h.step();
  assert_eq!(h.phase("wf[0].approve"), NodePhase::Running);
  assert!(h.requests.is_empty());

  assert!(resume_workflow(&mut h.workflow, h.now));
  h.step();
  assert_eq!(h.phase("wf[0].approve"), NodePhase::Succeeded);
  assert_eq!(h.node("wf[0].approve").message.as_deref(), Some("resumed"));
  assert_eq!(h.requests.len(), 1);
  assert!(h.has_pod("wf[1].after"));
  assert!(!resume_workflow(&mut h.workflow, h.now));
}
