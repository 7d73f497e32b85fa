use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::{debug, error};
use uuid::Uuid;

use crate::claim;
use crate::config::Config;
use crate::database::Stores;
use crate::errors::{TaskBackoff, TaskProcessorError};
use crate::metrics::{NoopMetrics, TaskMetrics};
use crate::models::{RecurringTask, RecurringTaskRun, Task, TaskKind, TaskResult, TaskRun};
use crate::registry::{Registry, TaskArgs, TaskCallable, TaskKwargs};

const RECURRING_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
  pub max_failures: i32,
  pub default_backoff_delay: std::time::Duration,
  pub grace_period: std::time::Duration,
}

impl Default for ProcessorOptions {
  fn default() -> Self {
    Self {
      max_failures: crate::models::MAX_NUM_FAILURES,
      default_backoff_delay: std::time::Duration::from_secs(5),
      grace_period: std::time::Duration::from_secs(30 * 60),
    }
  }
}

impl From<&Config> for ProcessorOptions {
  fn from(config: &Config) -> Self {
    Self {
      max_failures: config.max_failures,
      default_backoff_delay: config.default_backoff_delay,
      grace_period: config.grace_period,
    }
  }
}

enum Outcome {
  Success,
  Backoff { delay_until: Option<DateTime<Utc>> },
  Failure { error_details: String, finished_at: Option<DateTime<Utc>> },
}

// Runs claimed items to completion or failure and persists the outcome.
pub struct Processor {
  stores: Stores,
  registry: Arc<Registry>,
  metrics: Arc<dyn TaskMetrics>,
  options: ProcessorOptions,
}

impl Processor {
  pub fn new(stores: Stores, registry: Arc<Registry>) -> Self {
    Self {
      stores,
      registry,
      metrics: Arc::new(NoopMetrics),
      options: ProcessorOptions::default(),
    }
  }

  pub fn with_metrics(mut self, metrics: Arc<dyn TaskMetrics>) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn with_options(mut self, options: ProcessorOptions) -> Self {
    self.options = options;
    self
  }

  pub fn stores(&self) -> &Stores {
    &self.stores
  }

  // Claim a batch from the named store, execute every item, then persist all
  // outcomes with one batched write per table.
  pub async fn run_tasks(
    &self,
    database: &str,
    num_tasks: usize,
  ) -> Result<Vec<TaskRun>, TaskProcessorError> {
    if num_tasks < 1 {
      return Err(TaskProcessorError::InvalidBatchSize);
    }

    let batches =
      claim::tasks_to_process(&self.stores, database, num_tasks, self.options.max_failures).await?;

    let mut all_runs = Vec::new();
    for mut batch in batches {
      debug!("Running {} task(s) from database '{}'", batch.tasks.len(), batch.database);

      let mut runs = Vec::new();
      for task in &mut batch.tasks {
        if let Some(run) = self.run_task(task).await {
          runs.push(run);
        }
      }

      let pool = self.stores.get(&batch.database)?;
      write_back_tasks(pool, &batch.tasks).await?;
      insert_runs(pool, "task_runs", &runs).await?;

      debug!("Finished running {} task(s) from database '{}'", runs.len(), batch.database);
      all_runs.extend(runs);
    }
    Ok(all_runs)
  }

  pub async fn run_recurring_tasks(
    &self,
    database: &str,
  ) -> Result<Vec<RecurringTaskRun>, TaskProcessorError> {
    let pool = self.stores.get(database)?;
    let mut tasks = claim::recurring_tasks_to_process(pool, RECURRING_BATCH_SIZE).await?;
    if tasks.is_empty() {
      return Ok(Vec::new());
    }
    debug!("Running {} recurring task(s) from database '{database}'", tasks.len());

    let grace_period = chrono::Duration::milliseconds(self.options.grace_period.as_millis() as i64);
    let mut runs = Vec::new();
    let mut deleted: Vec<Uuid> = Vec::new();
    for task in &mut tasks {
      let now = Utc::now();
      if !self.registry.contains(&task.task_identifier) {
        // Old workers may still run during a rolling deploy; a definition is
        // only deleted once it has been unregistered past the grace period.
        if now - task.created_at > grace_period {
          debug!("Deleting unregistered recurring task '{}'", task.task_identifier);
          deleted.push(task.id);
        } else {
          task.unlock();
        }
        continue;
      }

      let last_run_started_at = last_recurring_run_started_at(pool, task.id).await?;
      if task.should_execute(last_run_started_at, now) {
        if let Some(run) = self.run_recurring_task(task).await {
          runs.push(run);
        }
      } else {
        task.unlock();
      }
    }

    let kept: Vec<&RecurringTask> =
      tasks.iter().filter(|task| !deleted.contains(&task.id)).collect();
    write_back_recurring_tasks(pool, &kept).await?;
    if !deleted.is_empty() {
      sqlx::query("DELETE FROM recurring_tasks WHERE id = ANY($1)")
        .bind(&deleted)
        .execute(pool)
        .await?;
    }
    insert_runs(pool, "recurring_task_runs", &runs).await?;

    if !runs.is_empty() {
      debug!("Finished running {} recurring task(s) from database '{database}'", runs.len());
    }
    Ok(runs)
  }

  async fn run_task(&self, task: &mut Task) -> Option<TaskRun> {
    let started_at = Utc::now();
    let timer = Instant::now();
    debug!(
      "Running task {} id={} args={} kwargs={}",
      task.task_identifier, task.id, task.args, task.kwargs
    );

    let outcome = match self.registry.get(&task.task_identifier) {
      Ok(registered) => {
        execute_callable(&registered.callable, task.args(), task.kwargs(), task.timeout()).await
      }
      Err(err) => Outcome::Failure {
        error_details: err.to_string(),
        finished_at: Some(Utc::now()),
      },
    };

    let run = match outcome {
      Outcome::Success => {
        task.mark_success();
        debug!("Task {} id={} completed", task.task_identifier, task.id);
        self.record_attempt(&task.task_identifier, TaskKind::Standard, TaskResult::Success, timer);
        Some(TaskRun::success(task.id, started_at))
      }
      Outcome::Backoff { delay_until } => {
        // Honored only while the retry ceiling has not been reached; past it
        // the signal leaves the task untouched.
        if task.num_failures < self.options.max_failures {
          let resume_at = delay_until.unwrap_or_else(|| {
            Utc::now()
              + chrono::Duration::milliseconds(
                self.options.default_backoff_delay.as_millis() as i64,
              )
          });
          debug!("Task {} id={} backed off until {resume_at}", task.task_identifier, task.id);
          task.scheduled_for = resume_at;
        }
        None
      }
      Outcome::Failure { error_details, finished_at } => {
        task.mark_failure();
        error!(
          "Failed to execute task '{}', with id {}. Exception: {}",
          task.task_identifier,
          task.id,
          first_line(&error_details)
        );
        self.record_attempt(&task.task_identifier, TaskKind::Standard, TaskResult::Failure, timer);
        Some(TaskRun::failure(task.id, started_at, finished_at, error_details))
      }
    };
    task.unlock();
    run
  }

  async fn run_recurring_task(&self, task: &mut RecurringTask) -> Option<RecurringTaskRun> {
    let started_at = Utc::now();
    let timer = Instant::now();
    debug!("Running recurring task {} id={}", task.task_identifier, task.id);

    let outcome = match self.registry.get(&task.task_identifier) {
      Ok(registered) => {
        execute_callable(&registered.callable, TaskArgs::new(), task.kwargs(), Some(task.timeout()))
          .await
      }
      Err(err) => Outcome::Failure {
        error_details: err.to_string(),
        finished_at: Some(Utc::now()),
      },
    };

    let run = match outcome {
      Outcome::Success => {
        debug!("Recurring task {} id={} completed", task.task_identifier, task.id);
        self.record_attempt(&task.task_identifier, TaskKind::Recurring, TaskResult::Success, timer);
        Some(RecurringTaskRun::success(task.id, started_at))
      }
      // Backoff from a recurring task is a programming error; surface it as a
      // failed attempt instead of silently ignoring the signal.
      Outcome::Backoff { .. } => {
        let error_details = "TaskBackoff is only valid for one-off tasks".to_string();
        error!(
          "Failed to execute task '{}', with id {}. Exception: {error_details}",
          task.task_identifier, task.id
        );
        self.record_attempt(&task.task_identifier, TaskKind::Recurring, TaskResult::Failure, timer);
        Some(RecurringTaskRun::failure(task.id, started_at, Some(Utc::now()), error_details))
      }
      Outcome::Failure { error_details, finished_at } => {
        error!(
          "Failed to execute task '{}', with id {}. Exception: {}",
          task.task_identifier,
          task.id,
          first_line(&error_details)
        );
        self.record_attempt(&task.task_identifier, TaskKind::Recurring, TaskResult::Failure, timer);
        Some(RecurringTaskRun::failure(task.id, started_at, finished_at, error_details))
      }
    };
    task.unlock();
    run
  }

  fn record_attempt(&self, task_identifier: &str, kind: TaskKind, result: TaskResult, timer: Instant) {
    self.metrics.task_finished(task_identifier, kind, result);
    self.metrics.task_duration(task_identifier, kind, result, timer.elapsed());
  }
}

// Run the callable on its own tokio task so the caller can enforce the
// wall-clock deadline. On deadline the join handle is dropped and the spawned
// task is left running to completion; only the caller's wait is abandoned.
async fn execute_callable(
  callable: &TaskCallable,
  args: TaskArgs,
  kwargs: TaskKwargs,
  timeout: Option<std::time::Duration>,
) -> Outcome {
  let handle = tokio::spawn((callable)(args, kwargs));

  let joined = match timeout {
    Some(timeout) => match tokio::time::timeout(timeout, handle).await {
      Ok(joined) => joined,
      Err(_) => {
        return Outcome::Failure {
          error_details: format!("TimeoutError: execution exceeded {timeout:?}"),
          finished_at: None,
        };
      }
    },
    None => handle.await,
  };

  match joined {
    Ok(Ok(())) => Outcome::Success,
    Ok(Err(err)) => match err.downcast::<TaskBackoff>() {
      Ok(backoff) => Outcome::Backoff { delay_until: backoff.delay_until },
      Err(err) => Outcome::Failure {
        error_details: format!("{err:?}"),
        finished_at: Some(Utc::now()),
      },
    },
    Err(join_err) => Outcome::Failure {
      error_details: format!("PanicError: {join_err}"),
      finished_at: Some(Utc::now()),
    },
  }
}

fn first_line(error_details: &str) -> &str {
  error_details.lines().next().unwrap_or_default()
}

async fn write_back_tasks(pool: &Pool<Postgres>, tasks: &[Task]) -> Result<(), sqlx::Error> {
  if tasks.is_empty() {
    return Ok(());
  }
  let ids: Vec<Uuid> = tasks.iter().map(|task| task.id).collect();
  let completed: Vec<bool> = tasks.iter().map(|task| task.completed).collect();
  let num_failures: Vec<i32> = tasks.iter().map(|task| task.num_failures).collect();
  let is_locked: Vec<bool> = tasks.iter().map(|task| task.is_locked).collect();
  let scheduled_for: Vec<DateTime<Utc>> = tasks.iter().map(|task| task.scheduled_for).collect();

  sqlx::query(
    "UPDATE tasks AS t SET \
       completed = u.completed, \
       num_failures = u.num_failures, \
       is_locked = u.is_locked, \
       scheduled_for = u.scheduled_for \
     FROM UNNEST($1::uuid[], $2::boolean[], $3::integer[], $4::boolean[], $5::timestamptz[]) \
       AS u(id, completed, num_failures, is_locked, scheduled_for) \
     WHERE t.id = u.id",
  )
  .bind(ids)
  .bind(completed)
  .bind(num_failures)
  .bind(is_locked)
  .bind(scheduled_for)
  .execute(pool)
  .await?;
  Ok(())
}

async fn write_back_recurring_tasks(
  pool: &Pool<Postgres>,
  tasks: &[&RecurringTask],
) -> Result<(), sqlx::Error> {
  if tasks.is_empty() {
    return Ok(());
  }
  let ids: Vec<Uuid> = tasks.iter().map(|task| task.id).collect();
  let is_locked: Vec<bool> = tasks.iter().map(|task| task.is_locked).collect();
  let locked_at: Vec<Option<DateTime<Utc>>> = tasks.iter().map(|task| task.locked_at).collect();

  sqlx::query(
    "UPDATE recurring_tasks AS t SET \
       is_locked = u.is_locked, \
       locked_at = u.locked_at \
     FROM UNNEST($1::uuid[], $2::boolean[], $3::timestamptz[]) AS u(id, is_locked, locked_at) \
     WHERE t.id = u.id",
  )
  .bind(ids)
  .bind(is_locked)
  .bind(locked_at)
  .execute(pool)
  .await?;
  Ok(())
}

async fn insert_runs(
  pool: &Pool<Postgres>,
  table: &str,
  runs: &[TaskRun],
) -> Result<(), sqlx::Error> {
  if runs.is_empty() {
    return Ok(());
  }
  let mut builder = sqlx::QueryBuilder::<Postgres>::new(format!(
    "INSERT INTO {table} (id, task_id, started_at, finished_at, result, error_details) "
  ));
  builder.push_values(runs, |mut row, run| {
    row
      .push_bind(run.id)
      .push_bind(run.task_id)
      .push_bind(run.started_at)
      .push_bind(run.finished_at)
      .push_bind(run.result)
      .push_bind(run.error_details.clone());
  });
  builder.build().execute(pool).await?;
  Ok(())
}

async fn last_recurring_run_started_at(
  pool: &Pool<Postgres>,
  task_id: Uuid,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
  sqlx::query_scalar(
    "SELECT started_at FROM recurring_task_runs WHERE task_id = $1 ORDER BY started_at DESC LIMIT 1",
  )
  .bind(task_id)
  .fetch_optional(pool)
  .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{DEFAULT_RECURRING_TIMEOUT_MS, TaskPriority};
  use anyhow::anyhow;
  use serde_json::{Map, Value};
  use std::sync::Mutex;

  fn processor_with(registry: Registry) -> Processor {
    Processor::new(Stores::new(vec![]), Arc::new(registry))
  }

  fn standard_task(task_identifier: &str) -> Task {
    let mut task = Task::create(
      task_identifier,
      Utc::now(),
      Vec::new(),
      Map::new(),
      TaskPriority::Normal,
      None,
    );
    task.is_locked = true;
    task
  }

  fn recurring_task(task_identifier: &str) -> RecurringTask {
    RecurringTask {
      id: Uuid::new_v4(),
      task_identifier: task_identifier.to_owned(),
      kwargs: Value::Object(Map::new()),
      priority: TaskPriority::Lowest,
      run_every_ms: 1_000,
      first_run_time: None,
      timeout_ms: DEFAULT_RECURRING_TIMEOUT_MS,
      is_locked: true,
      locked_at: Some(Utc::now()),
      created_at: Utc::now(),
    }
  }

  fn register_ok(registry: &mut Registry, task_identifier: &str) {
    registry.register_task(
      task_identifier,
      Arc::new(|_args, _kwargs| Box::pin(async { Ok(()) })),
      crate::handler::TaskOptions::default(),
    );
  }

  fn register_failing(registry: &mut Registry, task_identifier: &str, message: &'static str) {
    registry.register_task(
      task_identifier,
      Arc::new(move |_args, _kwargs| Box::pin(async move { Err(anyhow!(message)) })),
      crate::handler::TaskOptions::default(),
    );
  }

  fn register_backoff(
    registry: &mut Registry,
    task_identifier: &str,
    delay_until: Option<DateTime<Utc>>,
  ) {
    registry.register_task(
      task_identifier,
      Arc::new(move |_args, _kwargs| {
        Box::pin(async move { Err(TaskBackoff { delay_until }.into()) })
      }),
      crate::handler::TaskOptions::default(),
    );
  }

  #[tokio::test]
  async fn successful_task_is_completed_and_unlocked() {
    let mut registry = Registry::new();
    register_ok(&mut registry, "tasks.ok");
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.ok");
    let run = processor.run_task(&mut task).await.unwrap();

    assert!(task.completed);
    assert!(!task.is_locked);
    assert_eq!(task.num_failures, 0);
    assert_eq!(run.result, TaskResult::Success);
    assert!(run.finished_at.is_some());
    assert!(run.error_details.is_none());
  }

  #[tokio::test]
  async fn failing_task_records_failure_and_stays_incomplete() {
    let mut registry = Registry::new();
    register_failing(&mut registry, "tasks.fail", "Error!");
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.fail");
    let run = processor.run_task(&mut task).await.unwrap();

    assert!(!task.completed);
    assert!(!task.is_locked);
    assert_eq!(task.num_failures, 1);
    assert_eq!(run.result, TaskResult::Failure);
    assert!(run.finished_at.is_some());
    assert!(run.error_details.unwrap().contains("Error!"));
  }

  #[tokio::test]
  async fn timed_out_task_is_abandoned_without_finished_at() {
    let mut registry = Registry::new();
    registry.register_task(
      "tasks.sleep",
      Arc::new(|_args, _kwargs| {
        Box::pin(async {
          tokio::time::sleep(std::time::Duration::from_secs(5)).await;
          Ok(())
        })
      }),
      crate::handler::TaskOptions::default(),
    );
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.sleep");
    task.timeout_ms = Some(10);
    let run = processor.run_task(&mut task).await.unwrap();

    assert!(!task.completed);
    assert!(!task.is_locked);
    assert_eq!(task.num_failures, 1);
    assert_eq!(run.result, TaskResult::Failure);
    assert!(run.finished_at.is_none());
    assert!(run.error_details.unwrap().contains("Timeout"));
  }

  #[tokio::test]
  async fn unregistered_task_fails_without_crashing() {
    let processor = processor_with(Registry::new());

    let mut task = standard_task("tasks.missing");
    let run = processor.run_task(&mut task).await.unwrap();

    assert_eq!(run.result, TaskResult::Failure);
    assert!(run.error_details.unwrap().contains("no task registered"));
    assert_eq!(task.num_failures, 1);
    assert!(!task.is_locked);
  }

  #[tokio::test]
  async fn backoff_reschedules_with_default_delay() {
    let mut registry = Registry::new();
    register_backoff(&mut registry, "tasks.backoff", None);
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.backoff");
    let before = task.scheduled_for;
    let run = processor.run_task(&mut task).await;

    assert!(run.is_none());
    assert_eq!(task.num_failures, 0);
    assert!(!task.is_locked);
    let advanced = task.scheduled_for - before;
    assert!(advanced >= chrono::Duration::milliseconds(4_900));
    assert!(advanced <= chrono::Duration::milliseconds(5_500));
  }

  #[tokio::test]
  async fn backoff_honours_explicit_resume_time() {
    let resume_at = Utc::now() + chrono::Duration::minutes(10);
    let mut registry = Registry::new();
    register_backoff(&mut registry, "tasks.backoff", Some(resume_at));
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.backoff");
    let run = processor.run_task(&mut task).await;

    assert!(run.is_none());
    assert_eq!(task.scheduled_for, resume_at);
  }

  #[tokio::test]
  async fn backoff_past_retry_ceiling_is_a_no_op() {
    let mut registry = Registry::new();
    register_backoff(&mut registry, "tasks.backoff", None);
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.backoff");
    task.num_failures = 3;
    let before = task.scheduled_for;
    let run = processor.run_task(&mut task).await;

    assert!(run.is_none());
    assert_eq!(task.scheduled_for, before);
    assert_eq!(task.num_failures, 3);
    assert!(!task.is_locked);
  }

  #[tokio::test]
  async fn panicking_task_is_recorded_as_failure() {
    let mut registry = Registry::new();
    registry.register_task(
      "tasks.panic",
      Arc::new(|_args, _kwargs| Box::pin(async { panic!("boom") })),
      crate::handler::TaskOptions::default(),
    );
    let processor = processor_with(registry);

    let mut task = standard_task("tasks.panic");
    let run = processor.run_task(&mut task).await.unwrap();

    assert_eq!(run.result, TaskResult::Failure);
    assert_eq!(task.num_failures, 1);
  }

  #[tokio::test]
  async fn successful_recurring_task_releases_the_lease() {
    let mut registry = Registry::new();
    registry.register_recurring_task(
      "tasks.recurring",
      Arc::new(|_args, _kwargs| Box::pin(async { Ok(()) })),
      crate::registry::RecurringParams::new(std::time::Duration::from_secs(1)),
    );
    let processor = processor_with(registry);

    let mut task = recurring_task("tasks.recurring");
    let run = processor.run_recurring_task(&mut task).await.unwrap();

    assert_eq!(run.result, TaskResult::Success);
    assert!(!task.is_locked);
    assert!(task.locked_at.is_none());
  }

  #[tokio::test]
  async fn backoff_from_a_recurring_task_is_a_failure() {
    let mut registry = Registry::new();
    registry.register_recurring_task(
      "tasks.recurring",
      Arc::new(|_args, _kwargs| Box::pin(async { Err(TaskBackoff::new().into()) })),
      crate::registry::RecurringParams::new(std::time::Duration::from_secs(1)),
    );
    let processor = processor_with(registry);

    let mut task = recurring_task("tasks.recurring");
    let run = processor.run_recurring_task(&mut task).await.unwrap();

    assert_eq!(run.result, TaskResult::Failure);
    assert!(run.error_details.unwrap().contains("only valid for one-off tasks"));
    assert!(!task.is_locked);
  }

  #[derive(Default)]
  struct RecordingMetrics {
    finished: Mutex<Vec<(String, &'static str, &'static str)>>,
    durations: Mutex<Vec<(String, &'static str, &'static str)>>,
  }

  impl TaskMetrics for RecordingMetrics {
    fn task_enqueued(&self, _task_identifier: &str) {}

    fn task_finished(&self, task_identifier: &str, kind: TaskKind, result: TaskResult) {
      self
        .finished
        .lock()
        .unwrap()
        .push((task_identifier.to_owned(), kind.as_str(), result.as_str()));
    }

    fn task_duration(
      &self,
      task_identifier: &str,
      kind: TaskKind,
      result: TaskResult,
      _duration: std::time::Duration,
    ) {
      self
        .durations
        .lock()
        .unwrap()
        .push((task_identifier.to_owned(), kind.as_str(), result.as_str()));
    }
  }

  #[tokio::test]
  async fn attempts_emit_labelled_metrics() {
    let metrics = Arc::new(RecordingMetrics::default());
    let mut registry = Registry::new();
    register_ok(&mut registry, "tasks.ok");
    register_failing(&mut registry, "tasks.fail", "Error!");
    let processor = processor_with(registry).with_metrics(metrics.clone());

    let _ = processor.run_task(&mut standard_task("tasks.ok")).await;
    let _ = processor.run_task(&mut standard_task("tasks.fail")).await;

    let finished = metrics.finished.lock().unwrap();
    assert_eq!(
      finished.as_slice(),
      &[
        ("tasks.ok".to_string(), "standard", "success"),
        ("tasks.fail".to_string(), "standard", "failure"),
      ]
    );
    assert_eq!(metrics.durations.lock().unwrap().len(), 2);
  }
}
