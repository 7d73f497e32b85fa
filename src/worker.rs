use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::config::Config;
use crate::processor::Processor;

// Shared liveness timestamp for an external health check. The runner touches
// it once per iteration; a reading older than the caller's grace window means
// the loop has stalled.
#[derive(Clone)]
pub struct LivenessProbe {
  last_beat_ms: Arc<AtomicI64>,
}

impl LivenessProbe {
  fn new() -> Self {
    Self { last_beat_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())) }
  }

  fn touch(&self) {
    self.last_beat_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
  }

  pub fn is_alive(&self, grace: Duration) -> bool {
    let elapsed = Utc::now().timestamp_millis() - self.last_beat_ms.load(Ordering::Relaxed);
    elapsed <= grace.as_millis() as i64
  }
}

pub struct TaskRunner {
  processor: Arc<Processor>,
  batch_size: usize,
  sleep_interval: Duration,
  probe: LivenessProbe,
}

impl TaskRunner {
  pub fn new(processor: Arc<Processor>, config: &Config) -> Self {
    Self {
      processor,
      batch_size: config.batch_size,
      sleep_interval: config.sleep_interval,
      probe: LivenessProbe::new(),
    }
  }

  pub fn probe(&self) -> LivenessProbe {
    self.probe.clone()
  }

  // Poll at a fixed cadence until the shutdown flag flips. The iteration in
  // flight is allowed to finish; claimed work is never abandoned mid-loop.
  pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    info!("Task runner started, polling every {:?}", self.sleep_interval);
    loop {
      self.run_iteration().await;
      tokio::select! {
        _ = tokio::time::sleep(self.sleep_interval) => {}
        changed = shutdown.changed() => {
          // A dropped sender also means the host is going away.
          if changed.is_err() || *shutdown.borrow() {
            info!("Task runner stopping");
            return;
          }
        }
      }
    }
  }

  // One poll: standard tasks from every store, recurring tasks from the
  // designated store only. A store that errors is logged and skipped so the
  // remaining stores still get served.
  pub async fn run_iteration(&self) {
    self.probe.touch();

    let databases: Vec<String> = self.processor.stores().names().to_vec();
    for database in &databases {
      if let Err(err) = self.processor.run_tasks(database, self.batch_size).await {
        error!("Error handling tasks from database '{database}': {err:?}");
      }
    }

    let designated = self.processor.stores().task_store().to_owned();
    if let Err(err) = self.processor.run_recurring_tasks(&designated).await {
      error!("Error handling recurring tasks from database '{designated}': {err:?}");
    }
  }
}
