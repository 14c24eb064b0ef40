//! # Job Manager
//!
//! Registry of the jobs owned by this process. Every registered job runs
//! its own loop on a spawned task; operator calls are routed to the job by
//! name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::error::{Result, SyncError};
use crate::job::{Job, JobContext, JobStatus, SkipBy};

pub struct JobManager {
    ctx: JobContext,
    host_info: String,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

fn job_not_exist(name: &str) -> SyncError {
    SyncError::normal(format!("job not exist: {name}"))
}

impl JobManager {
    pub fn new(ctx: JobContext, host_info: impl Into<String>) -> Self {
        Self {
            ctx,
            host_info: host_info.into(),
            jobs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Validate, persist and start a new job.
    #[instrument(skip_all, fields(job = %job.name()))]
    pub async fn add_job(&self, job: Job) -> Result<()> {
        info!("Add job");
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job.name()) {
            return Err(SyncError::normal(format!("job exist, job: {}", job.name())));
        }

        job.first_run().await?;
        let data = job.info().await.to_json()?;
        self.ctx
            .store
            .add_job(job.name(), &data, &self.host_info)
            .await?;

        let job = Arc::new(job);
        jobs.insert(job.name().to_string(), job.clone());
        self.spawn(job).await;
        Ok(())
    }

    /// Load the named jobs from the store and start them. Jobs already
    /// running are left alone.
    pub async fn recover(&self, names: &[String]) -> Result<()> {
        info!(count = names.len(), "Job manager recover");
        let mut jobs = self.jobs.write().await;

        let mut recovered = Vec::new();
        for name in names {
            if jobs.contains_key(name) {
                continue;
            }
            info!(job = %name, "Recover job");
            let Some(data) = self.ctx.store.get_job_info(name).await? else {
                return Err(SyncError::normal(format!("job info not found: {name}")));
            };
            recovered.push(Arc::new(Job::from_json(&data, self.ctx.clone())?));
        }

        for job in recovered {
            jobs.insert(job.name().to_string(), job.clone());
            self.spawn(job).await;
        }
        Ok(())
    }

    /// Recover every job the store assigns to this host.
    pub async fn recover_owned(&self) -> Result<()> {
        let names = self.ctx.store.list_jobs_by_host(&self.host_info).await?;
        self.recover(&names).await
    }

    /// Delete a job. Its loop exits at the next tick boundary.
    pub async fn remove_job(&self, name: &str) -> Result<()> {
        info!(job = %name, "Remove job");
        let mut jobs = self.jobs.write().await;
        let job = jobs.get(name).ok_or_else(|| job_not_exist(name))?;

        job.delete();
        match self.ctx.store.remove_job(name).await {
            Ok(()) => {
                jobs.remove(name);
                info!(job = %name, "Job deleted, it stops at the next tick boundary");
                Ok(())
            }
            Err(err) => {
                error!(job = %name, error = %err, "Remove job in store failed, but job is stopped");
                Err(SyncError::db(format!(
                    "remove job [{name}] in db failed, but job is stopped, if can resume/delete, please do it manually"
                )))
            }
        }
    }

    /// Block until [`JobManager::stop`] is called.
    pub async fn start(&self) {
        info!(host = %self.host_info, "Job manager started");
        self.shutdown.cancelled().await;
    }

    /// Stop every job, then wait for all run loops to exit.
    pub async fn stop(&self) {
        {
            let jobs = self.jobs.read().await;
            for job in jobs.values() {
                job.stop();
            }
        }
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Job task failed to join");
            }
        }
        info!("Job manager stopped");
    }

    async fn spawn(&self, job: Arc<Job>) {
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            if let Err(err) = job.run().await {
                error!(job = %job.name(), error = %err, "Job run failed");
            }
        });
    }

    async fn get(&self, name: &str) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| job_not_exist(name))
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.get(name).await?.pause().await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.get(name).await?.resume().await
    }

    pub async fn job_status(&self, name: &str) -> Result<JobStatus> {
        Ok(self.get(name).await?.status())
    }

    pub async fn list_jobs(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.read().await;
        let mut statuses: Vec<JobStatus> = jobs.values().map(|job| job.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn desync(&self, name: &str) -> Result<()> {
        self.get(name).await?.desync().await
    }

    pub async fn update_host_mapping(
        &self,
        name: &str,
        src_mapping: HashMap<String, String>,
        dest_mapping: HashMap<String, String>,
    ) -> Result<()> {
        self.get(name)
            .await?
            .update_host_mapping(src_mapping, dest_mapping)
            .await
    }

    /// `skip_by` is the operator's spelling: `silence` or `fullsync`.
    pub async fn skip_binlog(&self, name: &str, commit_seq: i64, skip_by: &str) -> Result<()> {
        let skip_by: SkipBy = skip_by.parse()?;
        self.get(name).await?.skip_binlog(commit_seq, skip_by).await
    }
}
