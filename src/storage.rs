//! # Job Store
//!
//! Durable key-value contract used by jobs and the job manager. Job
//! descriptors and progress blobs are opaque strings keyed by job name; a
//! missing key is reported as `None`/`false`, never as an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{Result, SyncError, map_db_err};
use crate::models::{job, progress};

const CONNECT_ATTEMPTS: u32 = 5;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job owned by `host`. Fails if the job already exists.
    async fn add_job(&self, name: &str, info: &str, host: &str) -> Result<()>;
    async fn update_job(&self, name: &str, info: &str) -> Result<()>;
    /// Remove the job and its progress.
    async fn remove_job(&self, name: &str) -> Result<()>;
    async fn is_job_exist(&self, name: &str) -> Result<bool>;
    async fn get_job_info(&self, name: &str) -> Result<Option<String>>;
    async fn get_job_belong(&self, name: &str) -> Result<Option<String>>;
    async fn list_jobs_by_host(&self, host: &str) -> Result<Vec<String>>;
    /// Insert or overwrite the progress of a job.
    async fn update_progress(&self, name: &str, progress: &str) -> Result<()>;
    async fn get_progress(&self, name: &str) -> Result<Option<String>>;
    async fn is_progress_exist(&self, name: &str) -> Result<bool>;
}

/// [`JobStore`] backed by the `jobs` and `progresses` tables.
#[derive(Clone)]
pub struct SeaOrmJobStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmJobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Open the store named by `database_url`: connect with backoff, apply
    /// pending migrations and check the connection answers.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        if config.database_url.is_empty() {
            return Err(SyncError::db("job store database url is empty"));
        }

        let mut options = ConnectOptions::new(&config.database_url);
        options
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_millis(config.db_acquire_timeout_ms))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .sqlx_logging(true)
            .sqlx_logging_level(log::LevelFilter::Debug);

        let db = Self::open_with_retry(options).await?;
        Migrator::up(&db, None)
            .await
            .map_err(|e| map_db_err("apply job store migrations", e))?;

        let store = Self::new(Arc::new(db));
        store.health_check().await?;
        Ok(store)
    }

    async fn open_with_retry(options: ConnectOptions) -> Result<DatabaseConnection> {
        let mut retry_delay = Duration::from_millis(100);
        let mut attempt = 1;
        loop {
            match Database::connect(options.clone()).await {
                Ok(db) => {
                    info!(attempt, "Connected to job store");
                    return Ok(db);
                }
                Err(err) if attempt >= CONNECT_ATTEMPTS => {
                    error!(attempts = attempt, error = %err, "Failed to connect to job store");
                    return Err(map_db_err("connect job store", err));
                }
                Err(err) => {
                    warn!(attempt, error = %err, ?retry_delay, "Job store connection failed, retrying");
                    sleep(retry_delay).await;
                    retry_delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Verify the connection is still usable.
    pub async fn health_check(&self) -> Result<()> {
        let stmt = Statement::from_string(self.db.get_database_backend(), "SELECT 1".to_string());
        self.db
            .query_one(stmt)
            .await
            .map_err(|e| map_db_err("job store health check", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SeaOrmJobStore {
    async fn add_job(&self, name: &str, info: &str, host: &str) -> Result<()> {
        if self.is_job_exist(name).await? {
            return Err(SyncError::db(format!("job {name} already exists")));
        }

        let now = Utc::now().fixed_offset();
        let model = job::ActiveModel {
            job_name: Set(name.to_string()),
            job_info: Set(info.to_string()),
            belong_to: Set(host.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        model
            .insert(&*self.db)
            .await
            .map_err(|e| map_db_err("insert job", e))?;

        tracing::debug!(job = name, host, "Job stored");
        Ok(())
    }

    async fn update_job(&self, name: &str, info: &str) -> Result<()> {
        let existing = job::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await
            .map_err(|e| map_db_err("find job", e))?
            .ok_or_else(|| SyncError::db(format!("job {name} not found")))?;

        let mut model: job::ActiveModel = existing.into();
        model.job_info = Set(info.to_string());
        model.updated_at = Set(Utc::now().fixed_offset());
        model
            .update(&*self.db)
            .await
            .map_err(|e| map_db_err("update job", e))?;
        Ok(())
    }

    async fn remove_job(&self, name: &str) -> Result<()> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| map_db_err("begin remove job", e))?;

        job::Entity::delete_by_id(name.to_string())
            .exec(&txn)
            .await
            .map_err(|e| map_db_err("delete job", e))?;
        progress::Entity::delete_by_id(name.to_string())
            .exec(&txn)
            .await
            .map_err(|e| map_db_err("delete progress", e))?;

        txn.commit()
            .await
            .map_err(|e| map_db_err("commit remove job", e))?;

        tracing::info!(job = name, "Job removed from store");
        Ok(())
    }

    async fn is_job_exist(&self, name: &str) -> Result<bool> {
        let count = job::Entity::find_by_id(name.to_string())
            .count(&*self.db)
            .await
            .map_err(|e| map_db_err("count job", e))?;
        Ok(count > 0)
    }

    async fn get_job_info(&self, name: &str) -> Result<Option<String>> {
        let found = job::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await
            .map_err(|e| map_db_err("find job", e))?;
        Ok(found.map(|m| m.job_info))
    }

    async fn get_job_belong(&self, name: &str) -> Result<Option<String>> {
        let found = job::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await
            .map_err(|e| map_db_err("find job", e))?;
        Ok(found.map(|m| m.belong_to))
    }

    async fn list_jobs_by_host(&self, host: &str) -> Result<Vec<String>> {
        let jobs = job::Entity::find()
            .filter(job::Column::BelongTo.eq(host))
            .order_by_asc(job::Column::JobName)
            .all(&*self.db)
            .await
            .map_err(|e| map_db_err("list jobs", e))?;
        Ok(jobs.into_iter().map(|m| m.job_name).collect())
    }

    async fn update_progress(&self, name: &str, progress_blob: &str) -> Result<()> {
        let now = Utc::now().fixed_offset();
        let existing = progress::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await
            .map_err(|e| map_db_err("find progress", e))?;

        match existing {
            Some(found) => {
                let mut model: progress::ActiveModel = found.into();
                model.progress = Set(progress_blob.to_string());
                model.updated_at = Set(now);
                model
                    .update(&*self.db)
                    .await
                    .map_err(|e| map_db_err("update progress", e))?;
            }
            None => {
                let model = progress::ActiveModel {
                    job_name: Set(name.to_string()),
                    progress: Set(progress_blob.to_string()),
                    updated_at: Set(now),
                };
                model
                    .insert(&*self.db)
                    .await
                    .map_err(|e| map_db_err("insert progress", e))?;
            }
        }
        Ok(())
    }

    async fn get_progress(&self, name: &str) -> Result<Option<String>> {
        let found = progress::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await
            .map_err(|e| map_db_err("find progress", e))?;
        Ok(found.map(|m| m.progress))
    }

    async fn is_progress_exist(&self, name: &str) -> Result<bool> {
        let count = progress::Entity::find_by_id(name.to_string())
            .count(&*self.db)
            .await
            .map_err(|e| map_db_err("count progress", e))?;
        Ok(count > 0)
    }
}
