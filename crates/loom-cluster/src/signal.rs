use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Delivers a signal to a pod's main process through its agent.
#[async_trait]
pub trait PodSignaler: Send + Sync {
  async fn signal(&self, namespace: &str, pod: &str, signal: i32) -> Result<()>;
}

/// Records signals instead of delivering them.
#[derive(Default)]
pub struct MemorySignaler {
  sent: Mutex<Vec<(String, String, i32)>>,
}

impl MemorySignaler {
  pub fn new() -> Self {
    Self::default()
  }

  /// `(namespace, pod, signal)` in the order sent.
  pub fn signals(&self) -> Vec<(String, String, i32)> {
    self.sent.lock().clone()
  }
}

#[async_trait]
impl PodSignaler for MemorySignaler {
  async fn signal(&self, namespace: &str, pod: &str, signal: i32) -> Result<()> {
    self
      .sent
      .lock()
      .push((namespace.to_string(), pod.to_string(), signal));
    Ok(())
  }
}
