//! Database Journal (component E): the narrow interface the core consumes
//! to persist job/task lifecycle rows and read config/repository rows,
//! isolating the core from the actual store.
//!
//! Every call is its own transaction. Journal writes are best-effort from
//! the Manager's perspective: a failed write is logged but never changes
//! in-memory job state.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::JournalError;
use crate::model::{
    CheckConfig, CloudSyncConfig, CleanupConfig, JobId, JobSnapshot, JobStatus, NotificationConfig,
    Repository, RepositoryId, Schedule, ScheduleId, TaskIndex, TaskSnapshot,
};

/// Config rows addressable by `(kind, id)`, as referenced from a
/// submission's task parameters.
#[derive(Debug, Clone)]
pub enum ConfigRow {
    Cleanup(CleanupConfig),
    CloudSync(CloudSyncConfig),
    Notification(NotificationConfig),
    Check(CheckConfig),
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn create_job_row(&self, job: &JobSnapshot) -> Result<String, JournalError>;

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        finish_time: Option<DateTime<Utc>>,
        return_code: Option<i32>,
        error: Option<String>,
    ) -> Result<(), JournalError>;

    async fn upsert_task_row(
        &self,
        job_id: &JobId,
        task_index: TaskIndex,
        task: &TaskSnapshot,
    ) -> Result<(), JournalError>;

    /// Used at submit time to expand a referenced config into task
    /// parameters.
    async fn load_config(&self, kind: &str, id: &str) -> Result<Option<ConfigRow>, JournalError>;

    /// Decrypts the passphrase before returning.
    async fn load_repository(&self, id: &RepositoryId) -> Result<Option<Repository>, JournalError>;

    /// Used by the scheduler trigger surface to expand a fired schedule
    /// into a composite submission.
    async fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, JournalError>;
}

/// An in-memory test double. Not a production persistence layer.
#[derive(Default)]
pub struct InMemoryJournal {
    jobs: Mutex<HashMap<JobId, JobSnapshot>>,
    configs: Mutex<HashMap<(String, String), ConfigRow>>,
    repositories: Mutex<HashMap<RepositoryId, Repository>>,
    schedules: Mutex<HashMap<ScheduleId, Schedule>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_repository(&self, repo: Repository) {
        self.repositories.lock().unwrap().insert(repo.id.clone(), repo);
    }

    pub fn insert_config(&self, kind: &str, row: ConfigRow) {
        let id = match &row {
            ConfigRow::Cleanup(c) => c.id.clone(),
            ConfigRow::CloudSync(c) => c.id.clone(),
            ConfigRow::Notification(c) => c.id.clone(),
            ConfigRow::Check(c) => c.id.clone(),
        };
        self.configs
            .lock()
            .unwrap()
            .insert((kind.to_string(), id), row);
    }

    pub fn job_rows(&self) -> Vec<JobSnapshot> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn insert_schedule(&self, schedule: Schedule) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.id.clone(), schedule);
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn create_job_row(&self, job: &JobSnapshot) -> Result<String, JournalError> {
        self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
        Ok(job.id.clone())
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        finish_time: Option<DateTime<Utc>>,
        return_code: Option<i32>,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        let mut jobs = self.jobs.lock().unwrap();
        let row = jobs
            .get_mut(job_id)
            .ok_or_else(|| JournalError(format!("no such job row: {job_id}")))?;
        row.status = status;
        row.finished_at = finish_time;
        row.return_code = return_code;
        row.error = error;
        Ok(())
    }

    async fn upsert_task_row(
        &self,
        job_id: &JobId,
        task_index: TaskIndex,
        task: &TaskSnapshot,
    ) -> Result<(), JournalError> {
        let mut jobs = self.jobs.lock().unwrap();
        let row = jobs
            .get_mut(job_id)
            .ok_or_else(|| JournalError(format!("no such job row: {job_id}")))?;
        if task_index >= row.tasks.len() {
            row.tasks.resize(task_index + 1, task.clone());
        }
        row.tasks[task_index] = task.clone();
        Ok(())
    }

    async fn load_config(&self, kind: &str, id: &str) -> Result<Option<ConfigRow>, JournalError> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }

    async fn load_repository(&self, id: &RepositoryId) -> Result<Option<Repository>, JournalError> {
        Ok(self.repositories.lock().unwrap().get(id).cloned())
    }

    async fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, JournalError> {
        Ok(self.schedules.lock().unwrap().get(id).cloned())
    }
}

impl Clone for ConfigRow {
    fn clone(&self) -> Self {
        match self {
            ConfigRow::Cleanup(c) => ConfigRow::Cleanup(c.clone()),
            ConfigRow::CloudSync(c) => ConfigRow::CloudSync(c.clone()),
            ConfigRow::Notification(c) => ConfigRow::Notification(c.clone()),
            ConfigRow::Check(c) => ConfigRow::Check(c.clone()),
        }
    }
}
