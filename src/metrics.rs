use std::time::Duration;

use crate::models::{TaskKind, TaskResult};

// Observability collaborator. The engine reports enqueue and execution
// outcomes here; exposition (Prometheus endpoint, multi-process aggregation)
// is owned by the host application.
pub trait TaskMetrics: Send + Sync {
  fn task_enqueued(&self, task_identifier: &str);
  fn task_finished(&self, task_identifier: &str, kind: TaskKind, result: TaskResult);
  fn task_duration(
    &self,
    task_identifier: &str,
    kind: TaskKind,
    result: TaskResult,
    duration: Duration,
  );
}

pub struct NoopMetrics;

impl TaskMetrics for NoopMetrics {
  fn task_enqueued(&self, _task_identifier: &str) {}

  fn task_finished(&self, _task_identifier: &str, _kind: TaskKind, _result: TaskResult) {}

  fn task_duration(
    &self,
    _task_identifier: &str,
    _kind: TaskKind,
    _result: TaskResult,
    _duration: Duration,
  ) {
  }
}
