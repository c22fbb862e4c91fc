//! Deduplicating work queue of workflow keys.
//!
//! A key is in at most one of two places: waiting in the queue, or handed to
//! a worker. Adding a key that is already waiting is a no-op; adding a key
//! that a worker holds marks it dirty and it is queued again on [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
  queue: VecDeque<String>,
  /// Keys waiting for a worker, including in-flight keys that got new events.
  dirty: HashSet<String>,
  processing: HashSet<String>,
  shutdown: bool,
}

#[derive(Default)]
pub struct WorkQueue {
  state: Mutex<State>,
  notify: Notify,
}

impl WorkQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, key: impl Into<String>) {
    let key = key.into();
    let mut state = self.state.lock();
    if state.shutdown || !state.dirty.insert(key.clone()) {
      return;
    }
    if state.processing.contains(&key) {
      return;
    }
    state.queue.push_back(key);
    drop(state);
    self.notify.notify_one();
  }

  /// Wait for the next key. `None` once the queue is shut down.
  pub async fn get(&self) -> Option<String> {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut state = self.state.lock();
        if state.shutdown {
          return None;
        }
        if let Some(key) = state.queue.pop_front() {
          state.dirty.remove(&key);
          state.processing.insert(key.clone());
          let more = !state.queue.is_empty();
          drop(state);
          if more {
            self.notify.notify_one();
          }
          return Some(key);
        }
      }
      notified.await;
    }
  }

  /// Release a key handed out by [`WorkQueue::get`].
  pub fn done(&self, key: &str) {
    let mut state = self.state.lock();
    state.processing.remove(key);
    if state.dirty.contains(key) && !state.shutdown {
      state.queue.push_back(key.to_string());
      drop(state);
      self.notify.notify_one();
    }
  }

  pub fn shutdown(&self) {
    self.state.lock().shutdown = true;
    self.notify.notify_waiters();
  }

  /// Keys waiting for a worker.
  pub fn len(&self) -> usize {
    self.state.lock().queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn test_bursts_collapse_to_one_key() {
    let queue = WorkQueue::new();
    queue.add("default/a");
    queue.add("default/a");
    queue.add("default/b");
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.get().await.as_deref(), Some("default/a"));
    assert_eq!(queue.get().await.as_deref(), Some("default/b"));
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_in_flight_key_is_requeued_once_on_done() {
    let queue = WorkQueue::new();
    queue.add("default/a");
    let key = queue.get().await.unwrap();

    queue.add("default/a");
    queue.add("default/a");
    assert!(queue.is_empty(), "an in-flight key is never handed out twice");

    queue.done(&key);
    assert_eq!(queue.len(), 1);
    let again = queue.get().await.unwrap();
    queue.done(&again);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_get_wakes_on_add_and_stops_on_shutdown() {
    let queue = Arc::new(WorkQueue::new());
    let waiter = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.add("default/late");
    assert_eq!(waiter.await.unwrap().as_deref(), Some("default/late"));

    let stopped = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shutdown();
    assert_eq!(stopped.await.unwrap(), None);
    queue.add("default/ignored");
    assert!(queue.is_empty());
  }
}
