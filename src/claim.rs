use sqlx::{Pool, Postgres};
use tracing::{debug, warn};

use crate::database::Stores;
use crate::errors::TaskProcessorError;
use crate::models::{RecurringTask, Task};

// Claim routines. Each one selects eligible rows with FOR UPDATE SKIP LOCKED
// and flags them as locked inside the same transaction, so concurrent claim
// attempts never observe overlapping row sets. The routines are shipped as a
// migration and recreated lazily if a store has not run migrations yet.

const CREATE_GET_TASKS_TO_PROCESS: &str = r#"
CREATE OR REPLACE FUNCTION get_tasks_to_process(num_tasks integer, max_failures integer)
RETURNS SETOF tasks AS $$
DECLARE
    row_to_return tasks;
BEGIN
    FOR row_to_return IN
        SELECT *
        FROM tasks
        WHERE num_failures < max_failures AND scheduled_for <= NOW() AND completed = FALSE AND is_locked = FALSE
        ORDER BY priority ASC, scheduled_for ASC, created_at ASC
        LIMIT num_tasks
        FOR UPDATE SKIP LOCKED
    LOOP
        UPDATE tasks
        SET is_locked = TRUE
        WHERE id = row_to_return.id;
        row_to_return.is_locked := TRUE;
        RETURN NEXT row_to_return;
    END LOOP;

    RETURN;
END;
$$ LANGUAGE plpgsql
"#;

const CREATE_GET_RECURRING_TASKS_TO_PROCESS: &str = r#"
CREATE OR REPLACE FUNCTION get_recurring_tasks_to_process(num_tasks integer)
RETURNS SETOF recurring_tasks AS $$
DECLARE
    row_to_return recurring_tasks;
BEGIN
    FOR row_to_return IN
        SELECT *
        FROM recurring_tasks
        WHERE is_locked = FALSE OR locked_at < NOW() - (timeout_ms * interval '1 millisecond')
        ORDER BY created_at ASC
        LIMIT num_tasks
        FOR UPDATE SKIP LOCKED
    LOOP
        UPDATE recurring_tasks
        SET is_locked = TRUE, locked_at = NOW()
        WHERE id = row_to_return.id;
        row_to_return.is_locked := TRUE;
        row_to_return.locked_at := NOW();
        RETURN NEXT row_to_return;
    END LOOP;

    RETURN;
END;
$$ LANGUAGE plpgsql
"#;

const UNDEFINED_FUNCTION: &str = "42883";

fn is_undefined_function(err: &sqlx::Error) -> bool {
  matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNDEFINED_FUNCTION))
}

// A batch of claimed tasks together with the store they were claimed from,
// so outcomes are written back to the right physical database.
#[derive(Debug)]
pub struct ClaimedBatch {
  pub database: String,
  pub tasks: Vec<Task>,
}

async fn fetch_tasks(
  pool: &Pool<Postgres>,
  num_tasks: usize,
  max_failures: i32,
) -> Result<Vec<Task>, sqlx::Error> {
  sqlx::query_as::<_, Task>("SELECT * FROM get_tasks_to_process($1, $2)")
    .bind(num_tasks as i32)
    .bind(max_failures)
    .fetch_all(pool)
    .await
}

// Claim up to `num_tasks` from one store, recreating the claim routine and
// retrying once if it does not exist yet. A second failure propagates.
pub async fn tasks_from(
  pool: &Pool<Postgres>,
  num_tasks: usize,
  max_failures: i32,
) -> Result<Vec<Task>, sqlx::Error> {
  match fetch_tasks(pool, num_tasks, max_failures).await {
    Err(err) if is_undefined_function(&err) => {
      warn!("Claim routine get_tasks_to_process missing, recreating it");
      sqlx::query(CREATE_GET_TASKS_TO_PROCESS).execute(pool).await?;
      fetch_tasks(pool, num_tasks, max_failures).await
    }
    other => other,
  }
}

// Claim up to `num_tasks` against the named store. When the named store is the
// designated task store and a previous (shared) store is still configured, the
// previous store is drained to empty first so tasks enqueued before a cutover
// are not stranded. Claims against the previous store are best-effort.
pub async fn tasks_to_process(
  stores: &Stores,
  database: &str,
  num_tasks: usize,
  max_failures: i32,
) -> Result<Vec<ClaimedBatch>, TaskProcessorError> {
  let mut batches = Vec::new();
  let mut remaining = num_tasks;

  if database == stores.task_store() {
    if let Some(old) = stores.old_store().filter(|old| *old != database) {
      match tasks_from(stores.get(old)?, remaining, max_failures).await {
        Ok(tasks) => {
          remaining -= tasks.len();
          if !tasks.is_empty() {
            batches.push(ClaimedBatch { database: old.to_owned(), tasks });
          }
        }
        Err(err) => {
          debug!("Skipping previous task store '{old}': {err}");
        }
      }
    }
  }

  if remaining > 0 {
    let tasks = tasks_from(stores.get(database)?, remaining, max_failures).await?;
    if !tasks.is_empty() {
      batches.push(ClaimedBatch { database: database.to_owned(), tasks });
    }
  }

  Ok(batches)
}

async fn fetch_recurring_tasks(
  pool: &Pool<Postgres>,
  num_tasks: usize,
) -> Result<Vec<RecurringTask>, sqlx::Error> {
  sqlx::query_as::<_, RecurringTask>("SELECT * FROM get_recurring_tasks_to_process($1)")
    .bind(num_tasks as i32)
    .fetch_all(pool)
    .await
}

pub async fn recurring_tasks_to_process(
  pool: &Pool<Postgres>,
  num_tasks: usize,
) -> Result<Vec<RecurringTask>, TaskProcessorError> {
  let tasks = match fetch_recurring_tasks(pool, num_tasks).await {
    Err(err) if is_undefined_function(&err) => {
      warn!("Claim routine get_recurring_tasks_to_process missing, recreating it");
      sqlx::query(CREATE_GET_RECURRING_TASKS_TO_PROCESS).execute(pool).await?;
      fetch_recurring_tasks(pool, num_tasks).await?
    }
    other => other?,
  };
  Ok(tasks)
}
