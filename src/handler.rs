use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::TaskRunMethod;
use crate::errors::TaskProcessorError;
use crate::metrics::TaskMetrics;
use crate::models::{MAX_NUM_FAILURES, Task, TaskPriority};
use crate::registry::{TaskArgs, TaskCallable, TaskKwargs};

#[derive(Debug, Clone)]
pub struct TaskOptions {
  pub priority: TaskPriority,
  pub timeout: Option<Duration>,
  // Enqueueing is refused once this many uncompleted rows exist for the
  // identifier.
  pub queue_size: Option<i64>,
}

impl Default for TaskOptions {
  fn default() -> Self {
    Self {
      priority: TaskPriority::Lowest,
      timeout: None,
      queue_size: None,
    }
  }
}

// Handle returned by task registration. Exposes the execution-mode methods;
// which one `delay` uses is decided by the configured run method.
#[derive(Clone)]
pub struct TaskHandler {
  pub task_identifier: String,
  options: TaskOptions,
  callable: TaskCallable,
}

impl TaskHandler {
  pub(crate) fn new(task_identifier: &str, callable: TaskCallable, options: TaskOptions) -> Self {
    Self {
      task_identifier: task_identifier.to_owned(),
      options,
      callable,
    }
  }

  pub async fn run_synchronously(&self, args: TaskArgs, kwargs: TaskKwargs) -> Result<()> {
    (self.callable)(args, kwargs).await
  }

  pub fn run_in_background(&self, args: TaskArgs, kwargs: TaskKwargs) -> JoinHandle<()> {
    debug!("Running task {} in an unmanaged background task", self.task_identifier);
    let task_identifier = self.task_identifier.clone();
    let future = (self.callable)(args, kwargs);
    tokio::spawn(async move {
      if let Err(err) = future.await {
        error!("Background task {task_identifier} failed: {err:?}");
      }
    })
  }

  // Returns None without enqueueing when the configured queue size for this
  // identifier is already met.
  pub async fn enqueue(
    &self,
    pool: &Pool<Postgres>,
    metrics: &dyn TaskMetrics,
    args: TaskArgs,
    kwargs: TaskKwargs,
    delay: Option<Duration>,
  ) -> Result<Option<Task>, TaskProcessorError> {
    if let Some(queue_size) = self.options.queue_size {
      let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE task_identifier = $1 AND completed = FALSE AND num_failures < $2",
      )
      .bind(&self.task_identifier)
      .bind(MAX_NUM_FAILURES)
      .fetch_one(pool)
      .await?;
      if pending >= queue_size {
        warn!(
          "Not enqueueing task {} with args {args:?} kwargs {kwargs:?}: queue is full",
          self.task_identifier
        );
        return Ok(None);
      }
    }

    let scheduled_for = match delay {
      Some(delay) => Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
      None => Utc::now(),
    };
    let task = Task::create(
      &self.task_identifier,
      scheduled_for,
      args,
      kwargs,
      self.options.priority,
      self.options.timeout,
    );

    sqlx::query(
      "INSERT INTO tasks \
         (id, task_identifier, scheduled_for, args, kwargs, priority, timeout_ms, num_failures, completed, is_locked, created_at) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(task.id)
    .bind(&task.task_identifier)
    .bind(task.scheduled_for)
    .bind(&task.args)
    .bind(&task.kwargs)
    .bind(task.priority)
    .bind(task.timeout_ms)
    .bind(task.num_failures)
    .bind(task.completed)
    .bind(task.is_locked)
    .bind(task.created_at)
    .execute(pool)
    .await?;

    metrics.task_enqueued(&self.task_identifier);
    debug!("Enqueued task {} id={}", task.task_identifier, task.id);
    Ok(Some(task))
  }

  // Dispatch on the global run-mode setting.
  pub async fn delay(
    &self,
    run_method: TaskRunMethod,
    pool: &Pool<Postgres>,
    metrics: &dyn TaskMetrics,
    args: TaskArgs,
    kwargs: TaskKwargs,
    delay: Option<Duration>,
  ) -> Result<Option<Task>> {
    match run_method {
      TaskRunMethod::Synchronously => {
        self.run_synchronously(args, kwargs).await?;
        Ok(None)
      }
      TaskRunMethod::SeparateThread => {
        self.run_in_background(args, kwargs);
        Ok(None)
      }
      TaskRunMethod::TaskProcessor => {
        Ok(self.enqueue(pool, metrics, args, kwargs, delay).await?)
      }
    }
  }
}
