use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::database::{DEFAULT_STORE, TASK_PROCESSOR_STORE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunMethod {
  Synchronously,
  SeparateThread,
  TaskProcessor,
}

impl FromStr for TaskRunMethod {
  type Err = anyhow::Error;

  fn from_str(value: &str) -> Result<Self> {
    match value {
      "SYNCHRONOUSLY" => Ok(Self::Synchronously),
      "SEPARATE_THREAD" => Ok(Self::SeparateThread),
      "TASK_PROCESSOR" => Ok(Self::TaskProcessor),
      other => bail!("invalid TASK_RUN_METHOD '{other}'"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub task_processor_database_url: Option<String>,
  pub task_databases: Vec<String>,
  pub task_run_method: TaskRunMethod,
  pub batch_size: usize,
  pub sleep_interval: Duration,
  pub default_backoff_delay: Duration,
  pub max_failures: i32,
  pub grace_period: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let config = Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      task_processor_database_url: env::var("TASK_PROCESSOR_DATABASE_URL").ok(),
      task_databases: parse_databases(
        &env::var("TASK_PROCESSOR_DATABASES").unwrap_or_else(|_| DEFAULT_STORE.into()),
      ),
      task_run_method: env::var("TASK_RUN_METHOD")
        .unwrap_or_else(|_| "TASK_PROCESSOR".into())
        .parse()?,
      batch_size: env_parse("TASK_PROCESSOR_BATCH_SIZE", 10)?,
      sleep_interval: Duration::from_millis(env_parse("TASK_PROCESSOR_SLEEP_INTERVAL_MS", 2_000)?),
      default_backoff_delay: Duration::from_secs(env_parse("TASK_BACKOFF_DEFAULT_DELAY_SECONDS", 5)?),
      max_failures: env_parse("TASK_PROCESSOR_MAX_FAILURES", 3)?,
      grace_period: Duration::from_secs(env_parse("TASK_PROCESSOR_GRACE_PERIOD_MINUTES", 30)? * 60),
    };
    config.validate()?;
    Ok(config)
  }

  // Misconfiguration is fatal at startup, not recoverable at runtime.
  pub fn validate(&self) -> Result<()> {
    if self.task_databases.is_empty() {
      bail!("TASK_PROCESSOR_DATABASES must name at least one task store");
    }
    for name in &self.task_databases {
      if name != DEFAULT_STORE && name != TASK_PROCESSOR_STORE {
        bail!("unknown task store '{name}' in TASK_PROCESSOR_DATABASES");
      }
    }
    if self.task_databases.iter().any(|name| name == TASK_PROCESSOR_STORE)
      && self.task_processor_database_url.is_none()
    {
      bail!(
        "TASK_PROCESSOR_DATABASE_URL must be set when the '{TASK_PROCESSOR_STORE}' store is named in TASK_PROCESSOR_DATABASES"
      );
    }
    if self.batch_size < 1 {
      bail!("TASK_PROCESSOR_BATCH_SIZE must be at least one");
    }
    Ok(())
  }
}

fn parse_databases(value: &str) -> Vec<String> {
  value
    .split(',')
    .map(str::trim)
    .filter(|name| !name.is_empty())
    .map(str::to_owned)
    .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(key) {
    Ok(value) => value.parse().with_context(|| format!("invalid value for {key}")),
    Err(_) => Ok(default),
  }
}
