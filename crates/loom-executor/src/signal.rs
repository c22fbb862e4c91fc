//! The signal file channel.
//!
//! The controller writes a signal number to `<root>/signal`; the agent takes
//! the file and forwards the signal to the user command's process group.
//! Writers replace the file atomically and the reader renames it away before
//! reading, so every write is delivered at most once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, io_err};

/// Stand-in for signal payloads in logs.
pub const REDACTED: &str = "<redacted>";

/// The signal named by a payload. Child-stopped is never forwarded.
pub fn parse(payload: &str) -> Option<Signal> {
  let number: i32 = payload.trim().parse().ok()?;
  let signal = Signal::try_from(number).ok()?;
  (signal != Signal::SIGCHLD).then_some(signal)
}

/// Deliver to a process group; a group that already exited is not an error.
pub fn deliver(group: Pid, signal: Signal) -> Result<()> {
  match killpg(group, signal) {
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(err) => Err(err.into()),
  }
}

/// Atomically replace the signal file with `signal`.
pub async fn send(path: &Path, signal: i32) -> Result<()> {
  let staging = path.with_extension("pending");
  tokio::fs::write(&staging, signal.to_string())
    .await
    .map_err(io_err(format!("write {}", staging.display())))?;
  tokio::fs::rename(&staging, path)
    .await
    .map_err(io_err(format!("publish {}", path.display())))
}

/// Forward signals written to `path` until `cancel` fires.
///
/// File events wake the loop early; the poll interval covers filesystems
/// where notifications are unreliable.
pub async fn watch(path: PathBuf, group: Pid, poll: Duration, cancel: CancellationToken) {
  let (tx, mut rx) = mpsc::channel::<()>(16);
  let _watcher = start_watcher(&path, poll, tx.clone());
  let mut tick = tokio::time::interval(poll);
  tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = rx.recv() => {}
      _ = tick.tick() => {}
    }
    if let Err(err) = take(&path, group).await {
      warn!(error = %err, payload = REDACTED, "signal delivery failed");
    }
  }
  drop(tx);
}

fn start_watcher(path: &Path, poll: Duration, tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
  let dir = path.parent()?;
  let watcher = RecommendedWatcher::new(
    move |res: notify::Result<Event>| {
      if res.is_ok() {
        let _ = tx.try_send(());
      }
    },
    Config::default().with_poll_interval(poll),
  );
  match watcher {
    Ok(mut watcher) => match watcher.watch(dir, RecursiveMode::NonRecursive) {
      Ok(()) => Some(watcher),
      Err(err) => {
        debug!(error = %err, "signal file watch unavailable, polling");
        None
      }
    },
    Err(err) => {
      debug!(error = %err, "signal file watch unavailable, polling");
      None
    }
  }
}

async fn take(path: &Path, group: Pid) -> Result<Option<Signal>> {
  let taken = path.with_extension("taken");
  match tokio::fs::rename(path, &taken).await {
    Ok(()) => {}
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(err) => return Err(io_err(format!("take {}", path.display()))(err)),
  }
  let payload = tokio::fs::read_to_string(&taken)
    .await
    .map_err(io_err(format!("read {}", taken.display())))?;
  let _ = tokio::fs::remove_file(&taken).await;

  let Some(signal) = parse(&payload) else {
    warn!(payload = REDACTED, "ignoring unparseable signal payload");
    return Ok(None);
  };
  deliver(group, signal)?;
  info!(signal = %signal, "forwarded signal to command");
  Ok(Some(signal))
}
