use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveTime;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use crate::errors::TaskProcessorError;
use crate::handler::{TaskHandler, TaskOptions};
use crate::models::{DEFAULT_RECURRING_TIMEOUT_MS, TaskKind, TaskPriority};

pub type TaskArgs = Vec<Value>;
pub type TaskKwargs = Map<String, Value>;
pub type TaskCallable =
  Arc<dyn Fn(TaskArgs, TaskKwargs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTask {
  pub task_identifier: String,
  pub callable: TaskCallable,
  pub kind: TaskKind,
  pub recurring: Option<RecurringParams>,
}

#[derive(Debug, Clone)]
pub struct RecurringParams {
  pub run_every: std::time::Duration,
  pub first_run_time: Option<NaiveTime>,
  pub timeout_ms: i64,
  pub kwargs: TaskKwargs,
  pub priority: TaskPriority,
}

impl RecurringParams {
  pub fn new(run_every: std::time::Duration) -> Self {
    Self {
      run_every,
      first_run_time: None,
      timeout_ms: DEFAULT_RECURRING_TIMEOUT_MS,
      kwargs: TaskKwargs::new(),
      priority: TaskPriority::Lowest,
    }
  }
}

// Maps task identifiers to executable callables. Built explicitly at process
// start and shared with the execution engine; not designed for mutation
// during steady-state operation.
#[derive(Default)]
pub struct Registry {
  tasks: HashMap<String, RegisteredTask>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  // Re-registration under the same identifier replaces the callable.
  pub fn register_task(
    &mut self,
    task_identifier: &str,
    callable: TaskCallable,
    options: TaskOptions,
  ) -> TaskHandler {
    self.tasks.insert(
      task_identifier.to_owned(),
      RegisteredTask {
        task_identifier: task_identifier.to_owned(),
        callable: callable.clone(),
        kind: TaskKind::Standard,
        recurring: None,
      },
    );
    TaskHandler::new(task_identifier, callable, options)
  }

  pub fn register_recurring_task(
    &mut self,
    task_identifier: &str,
    callable: TaskCallable,
    params: RecurringParams,
  ) {
    debug!("Registering recurring task '{task_identifier}'");
    self.tasks.insert(
      task_identifier.to_owned(),
      RegisteredTask {
        task_identifier: task_identifier.to_owned(),
        callable,
        kind: TaskKind::Recurring,
        recurring: Some(params),
      },
    );
  }

  pub fn get(&self, task_identifier: &str) -> Result<&RegisteredTask, TaskProcessorError> {
    self
      .tasks
      .get(task_identifier)
      .ok_or_else(|| TaskProcessorError::TaskNotRegistered(task_identifier.to_owned()))
  }

  pub fn contains(&self, task_identifier: &str) -> bool {
    self.tasks.contains_key(task_identifier)
  }

  // Persist one recurring task row per registered recurring identifier.
  // Called once per process at startup, after all registrations have run.
  pub async fn initialise(&self, pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    for registered in self.tasks.values() {
      let Some(params) = &registered.recurring else {
        continue;
      };
      debug!("Persisting recurring task '{}'", registered.task_identifier);
      sqlx::query(
        "INSERT INTO recurring_tasks \
           (id, task_identifier, kwargs, priority, run_every_ms, first_run_time, timeout_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (task_identifier) DO UPDATE SET \
           kwargs = EXCLUDED.kwargs, \
           priority = EXCLUDED.priority, \
           run_every_ms = EXCLUDED.run_every_ms, \
           first_run_time = EXCLUDED.first_run_time, \
           timeout_ms = EXCLUDED.timeout_ms",
      )
      .bind(Uuid::new_v4())
      .bind(&registered.task_identifier)
      .bind(Value::Object(params.kwargs.clone()))
      .bind(params.priority)
      .bind(params.run_every.as_millis() as i64)
      .bind(params.first_run_time)
      .bind(params.timeout_ms)
      .execute(pool)
      .await?;
    }
    Ok(())
  }
}
