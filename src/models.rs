use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

pub const DEFAULT_RECURRING_TIMEOUT_MS: i64 = 30 * 60 * 1_000;

// Tasks at or above this failure count are dropped from selection.
pub const MAX_NUM_FAILURES: i32 = 3;

// Lower value wins the claim ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum TaskPriority {
  Highest = 0,
  High = 25,
  Normal = 50,
  Low = 75,
  Lowest = 100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_result", rename_all = "lowercase")]
pub enum TaskResult {
  Success,
  Failure,
}

impl TaskResult {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Success => "success",
      Self::Failure => "failure",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
  Standard,
  Recurring,
}

impl TaskKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Standard => "standard",
      Self::Recurring => "recurring",
    }
  }
}

#[derive(Debug, Clone, FromRow)]
pub struct Task {
  pub id: Uuid,
  pub task_identifier: String,
  pub scheduled_for: DateTime<Utc>,
  pub args: Value,
  pub kwargs: Value,
  pub priority: TaskPriority,
  pub timeout_ms: Option<i64>,
  pub num_failures: i32,
  pub completed: bool,
  pub is_locked: bool,
  pub created_at: DateTime<Utc>,
}

impl Task {
  pub fn create(
    task_identifier: &str,
    scheduled_for: DateTime<Utc>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    priority: TaskPriority,
    timeout: Option<std::time::Duration>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      task_identifier: task_identifier.to_owned(),
      scheduled_for,
      args: Value::Array(args),
      kwargs: Value::Object(kwargs),
      priority,
      timeout_ms: timeout.map(|timeout| timeout.as_millis() as i64),
      num_failures: 0,
      completed: false,
      is_locked: false,
      created_at: Utc::now(),
    }
  }

  pub fn args(&self) -> Vec<Value> {
    self.args.as_array().cloned().unwrap_or_default()
  }

  pub fn kwargs(&self) -> Map<String, Value> {
    self.kwargs.as_object().cloned().unwrap_or_default()
  }

  pub fn timeout(&self) -> Option<std::time::Duration> {
    self
      .timeout_ms
      .filter(|ms| *ms >= 0)
      .map(|ms| std::time::Duration::from_millis(ms as u64))
  }

  pub fn mark_success(&mut self) {
    self.completed = true;
  }

  pub fn mark_failure(&mut self) {
    self.num_failures += 1;
  }

  pub fn unlock(&mut self) {
    self.is_locked = false;
  }
}

#[derive(Debug, Clone, FromRow)]
pub struct RecurringTask {
  pub id: Uuid,
  pub task_identifier: String,
  pub kwargs: Value,
  pub priority: TaskPriority,
  pub run_every_ms: i64,
  pub first_run_time: Option<NaiveTime>,
  pub timeout_ms: i64,
  pub is_locked: bool,
  pub locked_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
}

impl RecurringTask {
  pub fn kwargs(&self) -> Map<String, Value> {
    self.kwargs.as_object().cloned().unwrap_or_default()
  }

  pub fn run_every(&self) -> Duration {
    Duration::milliseconds(self.run_every_ms)
  }

  pub fn timeout(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.timeout_ms.max(0) as u64)
  }

  // A held lock older than the task timeout is considered stale and reclaimable.
  pub fn is_lock_stale(&self, now: DateTime<Utc>) -> bool {
    match self.locked_at {
      Some(locked_at) => locked_at < now - Duration::milliseconds(self.timeout_ms),
      None => false,
    }
  }

  pub fn should_execute(&self, last_run_started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_run_started_at {
      Some(started_at) => started_at + self.run_every() <= now,
      None => match self.first_run_time {
        Some(first_run_time) => time_of_day_has_passed(first_run_time, now.time()),
        None => true,
      },
    }
  }

  pub fn unlock(&mut self) {
    self.is_locked = false;
    self.locked_at = None;
  }
}

// True iff `first_run_time` has passed within the trailing 12 hours, treating
// the clock as circular so an anchor shortly before midnight is still
// considered passed shortly after midnight.
fn time_of_day_has_passed(first_run_time: NaiveTime, now: NaiveTime) -> bool {
  let mut since = now - first_run_time;
  if since < Duration::zero() {
    since = since + Duration::hours(24);
  }
  since <= Duration::hours(12)
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRun {
  pub id: Uuid,
  pub task_id: Uuid,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub result: TaskResult,
  pub error_details: Option<String>,
}

impl TaskRun {
  pub fn success(task_id: Uuid, started_at: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      task_id,
      started_at,
      finished_at: Some(Utc::now()),
      result: TaskResult::Success,
      error_details: None,
    }
  }

  pub fn failure(
    task_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error_details: String,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      task_id,
      started_at,
      finished_at,
      result: TaskResult::Failure,
      error_details: Some(error_details),
    }
  }
}

pub type RecurringTaskRun = TaskRun;
