use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskProcessorError {
  #[error("no task registered with identifier '{0}'")]
  TaskNotRegistered(String),
  #[error("number of tasks to process must be at least one")]
  InvalidBatchSize,
  #[error("task store '{0}' is not configured")]
  UnknownStore(String),
  #[error(transparent)]
  Database(#[from] sqlx::Error),
}

/// Raised by a task callable to request a retry at a later time without
/// counting the attempt as a failure. Only valid for one-off tasks.
#[derive(Debug, Default, Error)]
#[error("task requested backoff")]
pub struct TaskBackoff {
  pub delay_until: Option<DateTime<Utc>>,
}

impl TaskBackoff {
  pub fn new() -> Self {
    Self { delay_until: None }
  }

  pub fn until(delay_until: DateTime<Utc>) -> Self {
    Self { delay_until: Some(delay_until) }
  }
}
