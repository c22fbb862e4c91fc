//! The main-container shim.
//!
//! Runs the user command in its own process group, tees its streams into the
//! agent volume, forwards signals from the signal file, enforces the deadline
//! and captures declared outputs. `exitcode` is always the last write.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use loom_config::Template;
use loom_workflow::contract::AGENT_FAULT_EXIT_CODE;

use crate::capture::capture_outputs;
use crate::config::AgentConfig;
use crate::error::{ExecutorError, Result, io_err};
use crate::paths::AgentPaths;
use crate::{payload, signal};

/// How long stream copies may outlive the command before they are dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervise the command and return the code written to `exitcode`.
///
/// `args` overrides the command derived from the staged template.
#[instrument(skip_all, fields(workflow = %config.workflow, node_id = %config.node_id))]
pub async fn run_emissary(config: &AgentConfig, args: &[String], echo: bool) -> i32 {
  let paths = config.paths();
  let code = match supervise(config, &paths, args, echo).await {
    Ok(code) => code,
    Err(err) => {
      error!(error = %err, "executor agent fault");
      if let Err(write_err) = tokio::fs::write(paths.fault(), err.to_string()).await {
        error!(error = %write_err, "failed to record agent fault");
      }
      AGENT_FAULT_EXIT_CODE
    }
  };
  if let Err(err) = write_exit_code(&paths, code).await {
    error!(error = %err, "failed to write exit code");
  }
  code
}

async fn supervise(config: &AgentConfig, paths: &AgentPaths, args: &[String], echo: bool) -> Result<i32> {
  let template = payload::read(paths).await?;
  let argv = if args.is_empty() {
    command_line(&template, paths)?
  } else {
    args.to_vec()
  };
  let (program, rest) = argv.split_first().ok_or(ExecutorError::NoCommand)?;

  let mut command = Command::new(program);
  command
    .args(rest)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .process_group(0);
  if let Some(container) = template.main_container() {
    for var in &container.env {
      command.env(&var.name, &var.value);
    }
    if let Some(dir) = &container.working_dir {
      command.current_dir(dir);
    }
  }

  let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
    command: argv.join(" "),
    source,
  })?;
  let group = child
    .id()
    .map(|pid| Pid::from_raw(pid as i32))
    .ok_or_else(|| ExecutorError::Spawn {
      command: argv.join(" "),
      source: std::io::Error::other("command exited before supervision started"),
    })?;
  info!(pid = %group, "command started");

  let stdout = child.stdout.take().map(|out| {
    tokio::spawn(tee(out, paths.stdout(), echo.then(tokio::io::stdout)))
  });
  let stderr = child.stderr.take().map(|err| {
    tokio::spawn(tee(err, paths.stderr(), echo.then(tokio::io::stderr)))
  });

  let cancel = CancellationToken::new();
  let watcher = tokio::spawn(signal::watch(
    paths.signal(),
    group,
    config.signal_poll,
    cancel.child_token(),
  ));
  let deadline = config.deadline.map(|deadline| {
    tokio::spawn(enforce_deadline(
      deadline,
      config.termination_grace,
      group,
      cancel.child_token(),
    ))
  });

  let status = child.wait().await.map_err(io_err("wait for command"))?;
  cancel.cancel();
  let _ = watcher.await;
  if let Some(deadline) = deadline {
    let _ = deadline.await;
  }
  for (stream, handle) in [("stdout", stdout), ("stderr", stderr)] {
    let Some(handle) = handle else { continue };
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
      Ok(Ok(Ok(bytes))) => debug!(stream, bytes, "stream drained"),
      Ok(Ok(Err(err))) => return Err(io_err(format!("capture {stream}"))(err)),
      Ok(Err(join)) => warn!(stream, error = %join, "stream copy panicked"),
      Err(_) => warn!(stream, "stream still open after command exit; truncating"),
    }
  }

  let code = exit_code(status);
  info!(exit_code = code, "command exited");
  capture_outputs(&template, paths, code == 0).await?;
  Ok(code)
}

/// The argv for a template: a script runs its command with the staged
/// source as last argument; a container runs command then args.
pub fn command_line(template: &Template, paths: &AgentPaths) -> Result<Vec<String>> {
  if let Some(script) = &template.script {
    let mut argv = script.container.command.clone();
    if argv.is_empty() {
      argv.push("sh".to_string());
    }
    argv.push(paths.script().display().to_string());
    return Ok(argv);
  }
  let container = template.container.as_ref().ok_or(ExecutorError::NoCommand)?;
  let argv: Vec<String> = container
    .command
    .iter()
    .chain(&container.args)
    .cloned()
    .collect();
  if argv.is_empty() {
    return Err(ExecutorError::NoCommand);
  }
  Ok(argv)
}

/// Normal exits keep their code; a signal death becomes `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
  match (status.code(), status.signal()) {
    (Some(code), _) => code,
    (None, Some(signo)) => 128 + signo,
    (None, None) => AGENT_FAULT_EXIT_CODE,
  }
}

async fn write_exit_code(paths: &AgentPaths, code: i32) -> Result<()> {
  let path = paths.exitcode();
  let staging: PathBuf = path.with_extension("pending");
  tokio::fs::write(&staging, code.to_string())
    .await
    .map_err(io_err(format!("write {}", staging.display())))?;
  tokio::fs::rename(&staging, &path)
    .await
    .map_err(io_err(format!("publish {}", path.display())))
}

async fn tee<R, W>(mut reader: R, path: PathBuf, mut echo: Option<W>) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut file = tokio::fs::File::create(&path).await?;
  let mut buf = vec![0u8; 8192];
  let mut total = 0u64;
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    file.write_all(&buf[..n]).await?;
    if let Some(out) = echo.as_mut()
      && out.write_all(&buf[..n]).await.is_err()
    {
      echo = None;
    }
    total += n as u64;
  }
  file.flush().await?;
  if let Some(out) = echo.as_mut() {
    let _ = out.flush().await;
  }
  Ok(total)
}

async fn enforce_deadline(
  deadline: DateTime<Utc>,
  grace: Duration,
  group: Pid,
  cancel: CancellationToken,
) {
  let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
  tokio::select! {
    _ = cancel.cancelled() => return,
    _ = tokio::time::sleep(remaining) => {}
  }
  warn!("deadline exceeded; terminating command");
  if let Err(err) = signal::deliver(group, Signal::SIGTERM) {
    warn!(error = %err, "failed to deliver SIGTERM");
  }
  tokio::select! {
    _ = cancel.cancelled() => return,
    _ = tokio::time::sleep(grace) => {}
  }
  warn!("command ignored SIGTERM; killing");
  if let Err(err) = signal::deliver(group, Signal::SIGKILL) {
    warn!(error = %err, "failed to deliver SIGKILL");
  }
}

/// Read a published exit code; `None` until the emissary is done.
pub async fn read_exit_code(path: &Path) -> Option<i32> {
  let text = tokio::fs::read_to_string(path).await.ok()?;
  text.trim().parse().ok()
}
