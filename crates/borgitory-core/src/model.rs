//! Core domain entities shared by every component.
//!
//! `ArchiveTreeNode` lives in [`crate::archive_tree`] since it is private
//! to that component's cache rather than part of the job/task lifecycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = String;
pub type TaskIndex = usize;
pub type RepositoryId = String;
pub type ScheduleId = String;

pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Identity of a Borg repository known to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub path: String,
    /// Decrypted at load time by the journal; never logged.
    pub passphrase_clear: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ManualBackup,
    ScheduledBackup,
    Prune,
    Check,
    CloudSync,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Prune,
    Check,
    CloudSync,
    Notification,
    /// Internal only: the single task of a `submit_simple` job, wrapping a
    /// raw command. Never produced from a composite-job submission.
    Raw,
}

impl TaskKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(TaskKind::Backup),
            "prune" => Some(TaskKind::Prune),
            "check" => Some(TaskKind::Check),
            "cloud_sync" => Some(TaskKind::CloudSync),
            "notification" => Some(TaskKind::Notification),
            _ => None,
        }
    }
}

/// Task statuses are the Job statuses minus `queued`, plus `skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Queue admission class. Each has its own concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    Backup,
    Operation,
}

/// A raw task descriptor as received from a submission, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDescriptor {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// A task's parsed, validated parameters. Built from a [`TaskDescriptor`]
/// by [`crate::commands::validate_task`] at submit time.
#[derive(Debug, Clone)]
pub enum TaskParams {
    Backup {
        source_path: String,
        compression: String,
        dry_run: bool,
    },
    Prune {
        keep_within_days: Option<u32>,
        keep_daily: Option<u32>,
        keep_weekly: Option<u32>,
        keep_monthly: Option<u32>,
        keep_yearly: Option<u32>,
        dry_run: bool,
        show_list: bool,
        show_stats: bool,
        save_space: bool,
        force_prune: bool,
    },
    Check {
        check_type: String,
        verify_data: bool,
        repair_mode: bool,
        save_space: bool,
        max_duration: Option<u64>,
        archive_prefix: Option<String>,
        archive_glob: Option<String>,
        first_n_archives: Option<u32>,
        last_n_archives: Option<u32>,
    },
    CloudSync {
        cloud_sync_config_id: String,
    },
    Notification {
        notification_config_id: String,
        notify_on_success: bool,
        notify_on_failure: bool,
    },
    Raw {
        argv: Vec<String>,
        env: HashMap<String, String>,
    },
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::Backup { .. } => TaskKind::Backup,
            TaskParams::Prune { .. } => TaskKind::Prune,
            TaskParams::Check { .. } => TaskKind::Check,
            TaskParams::CloudSync { .. } => TaskKind::CloudSync,
            TaskParams::Notification { .. } => TaskKind::Notification,
            TaskParams::Raw { .. } => TaskKind::Raw,
        }
    }
}

/// A single step within a Job.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub name: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(name: String, params: TaskParams) -> Self {
        Self {
            kind: params.kind(),
            name,
            params,
            status: TaskStatus::Pending,
            started_at: None,
            finished_at: None,
            return_code: None,
            error: None,
        }
    }
}

/// A unit of user-visible work: either a one-task "simple" job built from a
/// raw command, or a composite job built from an ordered task list.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub repository_id: Option<RepositoryId>,
    pub schedule_id: Option<ScheduleId>,
    pub composite: bool,
    pub tasks: Vec<Task>,
    pub current_task_index: TaskIndex,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    pub class: JobClass,
}

impl Job {
    /// Index of the first task with status `failed`, if the job is a
    /// terminally failed composite job.
    pub fn first_failed_task_index(&self) -> Option<TaskIndex> {
        self.tasks
            .iter()
            .position(|t| t.status == TaskStatus::Failed)
    }
}

/// A read-only view of a Job handed out by the manager's query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub repository_id: Option<RepositoryId>,
    pub schedule_id: Option<ScheduleId>,
    pub composite: bool,
    pub current_task_index: TaskIndex,
    pub tasks: Vec<TaskSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    pub current_progress: Option<crate::executor::ProgressSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub name: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(t: &Task) -> Self {
        Self {
            kind: t.kind,
            name: t.name.clone(),
            status: t.status,
            started_at: t.started_at,
            finished_at: t.finished_at,
            return_code: t.return_code,
            error: t.error.clone(),
        }
    }
}

/// A cron expression + target repository + pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub cron_expression: String,
    pub repository_id: RepositoryId,
    pub task_templates: Vec<TaskTemplate>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub kind: String,
    pub name: String,
    pub params: HashMap<String, serde_json::Value>,
}

/// Reusable pipeline-step config templates, referenced by id at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub id: String,
    pub enabled: bool,
    pub keep_within_days: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSyncConfig {
    pub id: String,
    pub enabled: bool,
    pub provider: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub id: String,
    pub enabled: bool,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub id: String,
    pub enabled: bool,
    pub check_type: String,
    pub verify_data: bool,
}
