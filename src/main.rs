use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loom_artifact::Store;
use loom_cluster::{Api, MemoryCluster};
use loom_config::{ShutdownStrategy, parse_manifest};
use loom_controller::{ArchiveSettings, Controller, ControllerConfig, open_archive};
use loom_executor::{AgentConfig, FileResultWriter, run_emissary, run_init, run_wait};
use loom_local::LocalKubelet;
use loom_workflow::contract::AGENT_FAULT_EXIT_CODE;
use loom_workflow::{Workflow, WorkflowPhase, stop_workflow};

/// Exit code for a configuration the controller refuses to start with.
const INVALID_CONFIG: u8 = 2;
const POLL: Duration = Duration::from_millis(200);

/// Loom - run DAG and step workflows as pods
#[derive(Parser)]
#[command(name = "loom")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Log line format
  #[arg(long, global = true, value_enum, default_value = "text", env = "LOOM_LOG_FORMAT")]
  log_format: LogFormat,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
  Text,
  Json,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow to completion on this host
  Run(RunArgs),

  /// In-pod agent roles
  Executor {
    #[command(subcommand)]
    role: Role,
  },
}

#[derive(clap::Args)]
struct RunArgs {
  /// Path to the workflow manifest (JSON or YAML)
  manifest: PathBuf,

  /// Controller configuration file (YAML or JSON)
  #[arg(long, env = "LOOM_CONFIG")]
  config: Option<PathBuf>,

  /// Namespace to submit into when the manifest names none
  #[arg(long, default_value = "default")]
  namespace: String,

  /// Number of reconcile workers
  #[arg(long, env = "LOOM_WORKERS")]
  workers: Option<usize>,

  /// Where pod directories and artifacts live (default: ~/.loom)
  #[arg(long, env = "LOOM_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// SQLite URL of the workflow archive
  #[arg(long, env = "LOOM_ARCHIVE_URL")]
  archive_url: Option<String>,
}

#[derive(Subcommand)]
enum Role {
  /// Stage the template, agent binary and inputs
  Init,
  /// Supervise the user command
  Emissary {
    /// Command to run instead of the staged template's
    #[arg(last = true)]
    args: Vec<String>,
  },
  /// Wait for the command, then report its outputs
  Wait,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.log_format);

  let rt = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(err) => {
      eprintln!("failed to start runtime: {err}");
      return ExitCode::FAILURE;
    }
  };

  match cli.command {
    Some(Commands::Run(args)) => match rt.block_on(run_workflow(args)) {
      Ok(code) => code,
      Err(err) => {
        error!(error = ?err, "run failed");
        ExitCode::FAILURE
      }
    },
    Some(Commands::Executor { role }) => {
      let code = rt.block_on(run_role(role));
      ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
    }
    None => {
      println!("loom - use --help to see available commands");
      ExitCode::SUCCESS
    }
  }
}

fn init_logging(format: LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr);
  match format {
    LogFormat::Text => builder.init(),
    LogFormat::Json => builder.json().init(),
  }
}

async fn run_workflow(args: RunArgs) -> Result<ExitCode> {
  let mut config = match &args.config {
    Some(path) => match ControllerConfig::load(path) {
      Ok(config) => config,
      Err(err) => {
        error!(error = %err, "invalid controller configuration");
        return Ok(ExitCode::from(INVALID_CONFIG));
      }
    },
    None => ControllerConfig::default(),
  };
  let data_dir = match args.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".loom"),
  };
  if let Some(workers) = args.workers {
    config.workers = workers;
  }
  if let Some(url) = args.archive_url {
    config.archive = Some(ArchiveSettings {
      database_url: url,
      ttl: None,
    });
  }
  if config.executor.artifact_root.is_none() {
    config.executor.artifact_root = Some(data_dir.join("artifacts").display().to_string());
  }
  if let Err(err) = config.validate() {
    error!(error = %err, "invalid controller configuration");
    return Ok(ExitCode::from(INVALID_CONFIG));
  }

  let workflow = load_workflow(&args.manifest, &args.namespace).await?;
  let archive = open_archive(config.archive.as_ref())
    .await
    .context("failed to open workflow archive")?;

  let cluster = MemoryCluster::new();
  let kubelet = Arc::new(LocalKubelet::new(cluster.cluster(), data_dir.join("pods")));
  let controller = Controller::new(cluster.cluster(), kubelet.clone(), config, archive);
  let cancel = CancellationToken::new();
  let controller_task = tokio::spawn(controller.run(cancel.clone()));
  let kubelet_task = tokio::spawn(kubelet.run(cancel.clone()));

  let namespace = workflow.metadata.namespace.clone();
  let name = workflow.metadata.name.clone();
  cluster
    .workflows
    .create(workflow)
    .await
    .context("failed to submit workflow")?;
  info!(workflow = %name, "workflow submitted");

  let finished = watch(&cluster, &namespace, &name).await;

  cancel.cancel();
  match controller_task.await {
    Ok(Ok(())) => {}
    Ok(Err(err)) => warn!(error = %err, "controller stopped with an error"),
    Err(err) => warn!(error = %err, "controller task failed"),
  }
  if let Err(err) = kubelet_task.await {
    warn!(error = %err, "kubelet task failed");
  }

  let finished = finished?;
  for node in finished.status.nodes.iter() {
    eprintln!(
      "{:<40} {:<10?} {}",
      node.name,
      node.phase,
      node.message.as_deref().unwrap_or("")
    );
  }
  println!("{}", serde_json::to_string_pretty(&finished.status)?);
  Ok(if finished.status.phase == WorkflowPhase::Succeeded {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

async fn load_workflow(path: &Path, namespace: &str) -> Result<Workflow> {
  let text = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
  let mut workflow: Workflow =
    parse_manifest(&text).with_context(|| format!("failed to parse workflow file: {}", path.display()))?;
  if workflow.metadata.name.is_empty() {
    workflow.metadata.name = path
      .file_stem()
      .and_then(|s| s.to_str())
      .unwrap_or("workflow")
      .to_string();
  }
  if workflow.metadata.namespace.is_empty() {
    workflow.metadata.namespace = namespace.to_string();
  }
  workflow.status = Default::default();
  Ok(workflow)
}

/// Poll until the workflow completes. Ctrl-C asks it to terminate and keeps
/// waiting for the controller to wind it down.
async fn watch(cluster: &MemoryCluster, namespace: &str, name: &str) -> Result<Workflow> {
  let mut interrupted = false;
  loop {
    let workflow = cluster
      .workflows
      .get(namespace, name)
      .await
      .context("workflow vanished")?;
    if workflow.is_completed() {
      return Ok(workflow);
    }
    tokio::select! {
      _ = tokio::time::sleep(POLL) => {}
      _ = tokio::signal::ctrl_c(), if !interrupted => {
        interrupted = true;
        warn!(workflow = %name, "interrupted; terminating workflow");
        let mut workflow = workflow;
        if stop_workflow(&mut workflow, ShutdownStrategy::Terminate) {
          cluster
            .workflows
            .replace(workflow)
            .await
            .context("failed to terminate workflow")?;
        }
      }
    }
  }
}

async fn run_role(role: Role) -> i32 {
  let config = match AgentConfig::from_env() {
    Ok(config) => config,
    Err(err) => {
      error!(error = %err, "executor agent misconfigured");
      return AGENT_FAULT_EXIT_CODE;
    }
  };
  let store = config.artifact_store();
  let store = store.as_ref().map(|s| s as &dyn Store);

  match role {
    Role::Init => {
      let binary = std::env::current_exe().ok();
      match run_init(&config, store, binary.as_deref()).await {
        Ok(_) => 0,
        Err(err) => {
          error!(error = %err, "init failed");
          AGENT_FAULT_EXIT_CODE
        }
      }
    }
    Role::Emissary { args } => run_emissary(&config, &args, true).await,
    Role::Wait => {
      let cancel = CancellationToken::new();
      let on_term = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          on_term.cancel();
        }
      });
      let writer = FileResultWriter::new(config.paths());
      match run_wait(&config, store, &writer, cancel).await {
        Ok(_) => 0,
        Err(err) => {
          error!(error = %err, "wait failed");
          AGENT_FAULT_EXIT_CODE
        }
      }
    }
  }
}
