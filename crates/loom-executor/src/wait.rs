//! The wait sidecar: turns what the emissary left on the volume into a
//! task result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use loom_artifact::{Store, artifact_key, upload_file};
use loom_cluster::{Api, TaskResult};
use loom_config::{Artifact, ObjectMeta, Outputs, Parameter, Template};
use loom_workflow::NodePhase;
use loom_workflow::contract::{LABEL_WORKFLOW, LABEL_WORKFLOW_NAMESPACE};

use crate::config::AgentConfig;
use crate::emissary::read_exit_code;
use crate::error::{ExecutorError, Result, io_err};
use crate::paths::AgentPaths;
use crate::payload;

/// Largest stdout returned as `outputs.result`.
const MAX_RESULT_BYTES: usize = 256 * 1024;
const WRITE_ATTEMPTS: u32 = 5;

/// Where the sidecar delivers its task result.
#[async_trait]
pub trait ResultWriter: Send + Sync {
  async fn write(&self, result: &TaskResult) -> Result<()>;
}

/// Creates the result object, replacing one left by an earlier attempt.
pub struct ApiResultWriter {
  api: Arc<dyn Api<TaskResult>>,
}

impl ApiResultWriter {
  pub fn new(api: Arc<dyn Api<TaskResult>>) -> Self {
    Self { api }
  }

  async fn write_once(&self, result: &TaskResult) -> loom_cluster::Result<()> {
    match self.api.create(result.clone()).await {
      Ok(_) => Ok(()),
      Err(err) if err.is_already_exists() => {
        let current = self
          .api
          .get(&result.metadata.namespace, &result.metadata.name)
          .await?;
        let mut next = result.clone();
        next.metadata.resource_version = current.metadata.resource_version;
        self.api.replace(next).await.map(|_| ())
      }
      Err(err) => Err(err),
    }
  }
}

#[async_trait]
impl ResultWriter for ApiResultWriter {
  async fn write(&self, result: &TaskResult) -> Result<()> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.write_once(result).await {
        Ok(()) => return Ok(()),
        Err(err) if (err.is_transient() || err.is_conflict()) && attempt < WRITE_ATTEMPTS => {
          warn!(error = %err, attempt, "task result write failed; retrying");
          tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }
}

/// Writes the result as JSON on the agent volume.
pub struct FileResultWriter {
  paths: AgentPaths,
}

impl FileResultWriter {
  pub fn new(paths: AgentPaths) -> Self {
    Self { paths }
  }
}

#[async_trait]
impl ResultWriter for FileResultWriter {
  async fn write(&self, result: &TaskResult) -> Result<()> {
    let path = self.paths.result();
    let json = serde_json::to_vec_pretty(result).map_err(|e| ExecutorError::Template {
      message: e.to_string(),
    })?;
    tokio::fs::write(&path, json)
      .await
      .map_err(io_err(format!("write {}", path.display())))
  }
}

/// Wait for the emissary's exit code, then collect outputs and write the
/// task result. A result is written even when collection fails.
#[instrument(skip_all, fields(workflow = %config.workflow, node_id = %config.node_id))]
pub async fn run_wait(
  config: &AgentConfig,
  store: Option<&dyn Store>,
  writer: &dyn ResultWriter,
  cancel: CancellationToken,
) -> Result<TaskResult> {
  let paths = config.paths();
  let result = match wait_for_exit(&paths, config.progress_tick, &cancel).await {
    Some(code) => match collect(config, &paths, code, store).await {
      Ok(result) => result,
      Err(err) => {
        error!(error = %err, "output collection failed");
        fault(config, err.to_string())
      }
    },
    None => fault(config, "pod stopped before the command exited".to_string()),
  };
  writer.write(&result).await?;
  info!(phase = ?result.phase, "task result written");
  Ok(result)
}

async fn wait_for_exit(paths: &AgentPaths, tick: Duration, cancel: &CancellationToken) -> Option<i32> {
  let path = paths.exitcode();
  let mut interval = tokio::time::interval(tick);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => return read_exit_code(&path).await,
      _ = interval.tick() => {}
    }
    if let Some(code) = read_exit_code(&path).await {
      return Some(code);
    }
  }
}

fn result_meta(config: &AgentConfig) -> ObjectMeta {
  ObjectMeta::new(&config.namespace, &config.node_id)
    .with_label(LABEL_WORKFLOW, &config.workflow)
    .with_label(LABEL_WORKFLOW_NAMESPACE, &config.namespace)
}

fn fault(config: &AgentConfig, message: String) -> TaskResult {
  TaskResult {
    metadata: result_meta(config),
    phase: Some(NodePhase::Error),
    message: Some(message),
    ..Default::default()
  }
}

async fn collect(
  config: &AgentConfig,
  paths: &AgentPaths,
  code: i32,
  store: Option<&dyn Store>,
) -> Result<TaskResult> {
  let template = payload::read(paths).await?;
  let mut result = TaskResult {
    metadata: result_meta(config),
    ..Default::default()
  };
  if let Ok(message) = tokio::fs::read_to_string(paths.fault()).await {
    result.phase = Some(NodePhase::Error);
    result.message = Some(message.trim().to_string());
  }

  let mut outputs = Outputs {
    exit_code: Some(code),
    ..Default::default()
  };
  outputs.parameters = collect_parameters(&template, paths).await?;
  if config.include_script_output {
    outputs.result = Some(script_result(paths).await?);
  }
  outputs.artifacts = upload_artifacts(config, &template, paths, store).await?;
  result.outputs = outputs;
  Ok(result)
}

async fn collect_parameters(template: &Template, paths: &AgentPaths) -> Result<Vec<Parameter>> {
  let mut parameters = Vec::new();
  for declared in &template.outputs.parameters {
    let path = paths.parameter(&declared.name);
    match tokio::fs::read_to_string(&path).await {
      Ok(value) => parameters.push(Parameter::new(&declared.name, value)),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
      Err(err) => return Err(io_err(format!("read {}", path.display()))(err)),
    }
  }
  Ok(parameters)
}

async fn script_result(paths: &AgentPaths) -> Result<String> {
  let path = paths.stdout();
  let bytes = match tokio::fs::read(&path).await {
    Ok(bytes) => bytes,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
    Err(err) => return Err(io_err(format!("read {}", path.display()))(err)),
  };
  let mut text = String::from_utf8_lossy(&bytes).trim().to_string();
  if text.len() > MAX_RESULT_BYTES {
    let mut cut = MAX_RESULT_BYTES;
    while !text.is_char_boundary(cut) {
      cut -= 1;
    }
    text.truncate(cut);
  }
  Ok(text)
}

async fn upload_artifacts(
  config: &AgentConfig,
  template: &Template,
  paths: &AgentPaths,
  store: Option<&dyn Store>,
) -> Result<Vec<Artifact>> {
  let mut artifacts = Vec::new();
  for declared in &template.outputs.artifacts {
    let archive = paths.artifact(&declared.name);
    if !archive.exists() {
      continue;
    }
    let store = store.ok_or(ExecutorError::NoRepository)?;
    let key = artifact_key(&config.namespace, &config.workflow, &config.node_id, &declared.name);
    upload_file(store, &key, &archive).await?;
    debug!(artifact = %declared.name, key = %key, "artifact uploaded");
    artifacts.push(Artifact {
      name: declared.name.clone(),
      path: declared.path.clone(),
      key: Some(key),
      ..Default::default()
    });
  }
  Ok(artifacts)
}
