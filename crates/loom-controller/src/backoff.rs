//! Per-key exponential backoff with jitter for transient reconcile failures.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Requeue;

pub struct RequeueBackoff {
  base: Duration,
  cap: Duration,
  failures: Mutex<HashMap<String, u32>>,
}

impl RequeueBackoff {
  pub fn new(settings: &Requeue) -> Self {
    Self {
      base: settings.base,
      cap: settings.cap,
      failures: Mutex::new(HashMap::new()),
    }
  }

  /// Record a failure of `key` and return how long to wait before retrying.
  /// The wait doubles per consecutive failure, capped, then scaled by a
  /// random factor in `[0.5, 1.0]`.
  pub fn next(&self, key: &str) -> Duration {
    let attempt = {
      let mut failures = self.failures.lock();
      let count = failures.entry(key.to_string()).or_insert(0);
      *count = count.saturating_add(1);
      *count
    };
    let exponent = attempt.saturating_sub(1).min(30);
    let ceiling = self
      .base
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.cap)
      .min(self.cap);
    ceiling.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
  }

  pub fn forget(&self, key: &str) {
    self.failures.lock().remove(key);
  }

  pub fn failures(&self, key: &str) -> u32 {
    self.failures.lock().get(key).copied().unwrap_or(0)
  }
}
