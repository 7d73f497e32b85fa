use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

use crate::config::Config;
use crate::errors::TaskProcessorError;

pub static MIGRATOR: Migrator = sqlx::migrate!();

pub const DEFAULT_STORE: &str = "default";
pub const TASK_PROCESSOR_STORE: &str = "task_processor";

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub async fn connect_store(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Pool::<Postgres>::connect(database_url)
  })
  .await
  .context("failed to connect to database")?;

  // Task tables are migrated in every configured store to allow transitions
  // between single- and dual-database topologies.
  MIGRATOR.run(&pool).await.context("failed to run database migrations")?;
  info!("Database migrations complete");
  Ok(pool)
}

// The ordered set of physical databases designated to hold task data.
#[derive(Clone)]
pub struct Stores {
  names: Vec<String>,
  pools: HashMap<String, Pool<Postgres>>,
}

impl Stores {
  pub fn new(stores: Vec<(String, Pool<Postgres>)>) -> Self {
    let names = stores.iter().map(|(name, _)| name.clone()).collect();
    let pools = stores.into_iter().collect();
    Self { names, pools }
  }

  pub async fn from_config(config: &Config) -> Result<Self> {
    config.validate()?;

    let mut stores = Vec::with_capacity(config.task_databases.len());
    for name in &config.task_databases {
      let url = match name.as_str() {
        DEFAULT_STORE => &config.database_url,
        TASK_PROCESSOR_STORE => config
          .task_processor_database_url
          .as_ref()
          .context("TASK_PROCESSOR_DATABASE_URL must be set")?,
        other => bail!("unknown task store '{other}'"),
      };
      let pool = connect_store(url)
        .await
        .with_context(|| format!("task store '{name}' is unreachable"))?;
      stores.push((name.clone(), pool));
    }
    Ok(Self::new(stores))
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn get(&self, name: &str) -> Result<&Pool<Postgres>, TaskProcessorError> {
    self
      .pools
      .get(name)
      .ok_or_else(|| TaskProcessorError::UnknownStore(name.to_owned()))
  }

  // The store that owns task writes and recurring task definitions.
  pub fn task_store(&self) -> &str {
    designated_store(&self.names)
  }

  pub fn task_pool(&self) -> Result<&Pool<Postgres>, TaskProcessorError> {
    self.get(self.task_store())
  }

  // During a dual-database migration the shared store still holds task rows
  // enqueued before the cutover; it must be drained first.
  pub fn old_store(&self) -> Option<&str> {
    old_store(&self.names)
  }
}

fn designated_store(names: &[String]) -> &str {
  names
    .iter()
    .find(|name| name.as_str() == TASK_PROCESSOR_STORE)
    .map(String::as_str)
    .unwrap_or(DEFAULT_STORE)
}

fn old_store(names: &[String]) -> Option<&str> {
  let has_dedicated = names.iter().any(|name| name == TASK_PROCESSOR_STORE);
  let has_default = names.iter().any(|name| name == DEFAULT_STORE);
  (has_dedicated && has_default).then_some(DEFAULT_STORE)
}
