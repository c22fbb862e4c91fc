//! One timer per workflow key.
//!
//! Deadlines, retry backoffs, TTLs and requeue-after hints all collapse into
//! the earliest pending instant for the key, so the number of timers tracks
//! the number of active workflows rather than nodes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::queue::WorkQueue;

#[derive(Default)]
struct State {
  due: HashMap<String, Instant>,
  order: BTreeSet<(Instant, String)>,
}

#[derive(Default)]
pub struct TimerWheel {
  state: Mutex<State>,
  notify: Notify,
}

impl TimerWheel {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fire `key` after `delay`, unless it is already due sooner.
  pub fn schedule(&self, key: &str, delay: Duration) {
    let at = Instant::now() + delay;
    let mut state = self.state.lock();
    if let Some(current) = state.due.get(key).copied() {
      if current <= at {
        return;
      }
      state.order.remove(&(current, key.to_string()));
    }
    state.due.insert(key.to_string(), at);
    state.order.insert((at, key.to_string()));
    drop(state);
    self.notify.notify_one();
  }

  pub fn cancel(&self, key: &str) {
    let mut state = self.state.lock();
    if let Some(at) = state.due.remove(key) {
      state.order.remove(&(at, key.to_string()));
    }
  }

  pub fn pending(&self) -> usize {
    self.state.lock().due.len()
  }

  fn take_due(&self, now: Instant) -> (Vec<String>, Option<Instant>) {
    let mut state = self.state.lock();
    let mut fired = Vec::new();
    while let Some((at, key)) = state.order.first().cloned() {
      if at > now {
        return (fired, Some(at));
      }
      state.order.pop_first();
      state.due.remove(&key);
      fired.push(key);
    }
    (fired, None)
  }

  /// Move due keys onto the queue until cancelled.
  pub async fn run(self: Arc<Self>, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let (fired, next) = self.take_due(Instant::now());
      for key in fired {
        trace!(workflow = %key, "timer fired");
        queue.add(key);
      }
      let sleep = async {
        match next {
          Some(at) => tokio::time::sleep_until(at).await,
          None => std::future::pending().await,
        }
      };
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = &mut notified => {}
        _ = sleep => {}
      }
    }
  }
}
