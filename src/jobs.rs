//! Background video jobs.
//!
//! The job table is the only state shared between requests and workers.
//! Readers take snapshots; each job's record is written only through the
//! [`JobHandle`] owned by the worker running it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::pipeline::{Pipeline, RenderRequest, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub video_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn queued(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0,
            video_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct JobTable {
    records: HashMap<Uuid, JobRecord>,
    /// Ids of finished jobs in the order they finished.
    finished: VecDeque<Uuid>,
}

impl JobTable {
    fn count(&self, status: JobStatus) -> usize {
        self.records
            .values()
            .filter(|job| job.status == status)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<JobTable>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, JobTable> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobTable> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.read().records.get(id).cloned()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.read().count(status)
    }

    /// Registers a new queued job and hands out its only writer, unless
    /// `max_queued` jobs are already waiting. The check and the insert
    /// happen under one lock. Finished records beyond `max_finished` are
    /// dropped, oldest first.
    pub fn create(&self, max_queued: usize, max_finished: usize) -> Result<JobHandle, SubmitError> {
        let mut table = self.write();
        let waiting = table.count(JobStatus::Queued);
        if waiting >= max_queued {
            return Err(SubmitError::QueueFull(waiting));
        }

        while table.finished.len() > max_finished {
            if let Some(expired) = table.finished.pop_front() {
                table.records.remove(&expired);
                tracing::debug!(job_id = %expired, "evicted finished job record");
            }
        }

        let id = Uuid::new_v4();
        table.records.insert(id, JobRecord::queued(id));
        Ok(JobHandle {
            id,
            store: self.clone(),
            finished: false,
        })
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut JobRecord)) {
        let mut table = self.write();
        let Some(job) = table.records.get_mut(&id) else {
            return;
        };
        if job.status.is_terminal() {
            tracing::warn!(job_id = %id, status = ?job.status, "ignoring update to finished job");
            return;
        }
        apply(job);
        job.updated_at = Utc::now();
        if job.status.is_terminal() {
            table.finished.push_back(id);
        }
    }
}

/// Write access to one job record. Not cloneable: one worker, one writer.
///
/// Dropping a handle before `complete` or `fail` (a panicking worker)
/// marks the job as failed so it never stays `processing`.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    store: JobStore,
    finished: bool,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start(&self) {
        self.store.update(self.id, |job| {
            job.status = JobStatus::Processing;
        });
    }

    /// Progress never moves backwards.
    pub fn progress(&self, percent: u8) {
        self.store.update(self.id, |job| {
            job.progress = job.progress.max(percent.min(100));
        });
    }

    pub fn complete(mut self, video_path: PathBuf) {
        self.store.update(self.id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.video_path = Some(video_path);
            job.error = None;
        });
        self.finished = true;
    }

    pub fn fail(mut self, message: String) {
        self.record_failure(message);
    }

    fn record_failure(&mut self, message: String) {
        self.store.update(self.id, |job| {
            job.status = JobStatus::Error;
            job.video_path = None;
            job.error = Some(message);
        });
        self.finished = true;
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(job_id = %self.id, "job worker stopped before finishing");
            self.record_failure("job worker stopped unexpectedly".to_owned());
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job queue is full ({0} jobs waiting)")]
    QueueFull(usize),
}

/// Bounded worker pool in front of the pipeline.
#[derive(Clone)]
pub struct JobRunner {
    store: JobStore,
    pipeline: Pipeline,
    slots: Arc<Semaphore>,
    max_queued: usize,
    max_finished: usize,
}

impl JobRunner {
    pub fn new(store: JobStore, pipeline: Pipeline) -> Self {
        let server = &pipeline.settings().server;
        let slots = Arc::new(Semaphore::new(server.max_concurrent_jobs.max(1)));
        let max_queued = server.max_queued_jobs;
        let max_finished = server.max_finished_jobs;
        Self {
            store,
            pipeline,
            slots,
            max_queued,
            max_finished,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Queues the request and returns its job id without waiting for any
    /// work to start.
    pub fn submit(&self, request: RenderRequest) -> Result<Uuid, SubmitError> {
        let handle = self.store.create(self.max_queued, self.max_finished)?;
        let id = handle.id();
        let pipeline = self.pipeline.clone();
        let slots = Arc::clone(&self.slots);
        tracing::info!(job_id = %id, "job queued");

        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    handle.fail("worker pool shut down".to_owned());
                    return;
                }
            };
            run_job(pipeline, handle, request).await;
        });

        Ok(id)
    }
}

async fn run_job(pipeline: Pipeline, handle: JobHandle, request: RenderRequest) {
    let id = handle.id();
    handle.start();
    tracing::info!(job_id = %id, "job started");

    let key = id.to_string();
    let report = |stage: Stage| {
        tracing::debug!(job_id = %id, stage = ?stage, "stage complete");
        handle.progress(stage.progress());
    };
    let result = pipeline.run(request, &key, &report).await;

    match result {
        Ok(path) => {
            tracing::info!(job_id = %id, video = %path.display(), "job completed");
            handle.complete(path);
        }
        Err(error) => {
            tracing::error!(job_id = %id, code = error.code(), error = %error, "job failed");
            handle.fail(error.to_string());
        }
    }
}
