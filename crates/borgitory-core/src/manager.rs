//! Job Manager (component F): composes the Executor, Output Buffer,
//! Broadcaster, Queue and Journal into simple and composite jobs, drives
//! the job/task state machine, and emits events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::archive_tree::{ArchiveExplorer, DirectoryEntry};
use crate::broadcaster::{EventBroadcaster, JobEvent, SubscriberHandle};
use crate::commands;
use crate::config::RuntimeConfig;
use crate::error::{ArchiveBrowseError, SubmitError};
use crate::executor::{self, OutputLine, ProgressSnapshot};
use crate::journal::{ConfigRow, Journal};
use crate::model::{
    new_job_id, Job, JobClass, JobId, JobKind, JobStatus, Repository, RepositoryId, ScheduleId,
    Task, TaskDescriptor, TaskParams, TaskSnapshot, TaskStatus,
};
use crate::output_buffer::{BufferSnapshot, Follow, OutputBuffer};
use crate::queue::{Queue, QueueStats};

/// An in-process cancellation signal for a running job, checked before
/// each task starts and raced against the current task's I/O.
struct CancelToken {
    notify: Notify,
    flag: AtomicBool,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            flag: AtomicBool::new(false),
        }
    }

    fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

enum TaskOutcome {
    Completed,
    Failed { return_code: i32, error: String },
    Cancelled { return_code: i32 },
}

enum TaskListOutcome {
    Completed,
    Failed { return_code: i32, error: String },
    Cancelled,
}

/// The constructed value owning every core component. Replaces the
/// module-global singletons of the legacy implementation.
pub struct Core {
    config: RuntimeConfig,
    output_buffer: Arc<OutputBuffer>,
    broadcaster: Arc<EventBroadcaster>,
    queue: Arc<Queue>,
    journal: Arc<dyn Journal>,
    jobs: RwLock<HashMap<JobId, Job>>,
    cancels: Mutex<HashMap<JobId, Arc<CancelToken>>>,
    http: reqwest::Client,
    archive_explorer: ArchiveExplorer,
}

impl Core {
    pub fn start(config: RuntimeConfig, journal: Arc<dyn Journal>) -> Arc<Self> {
        let (queue, admitted_rx) = Queue::new(
            config.max_concurrent_backups,
            config.max_concurrent_operations,
            config.queue_poll_interval,
        );
        let output_buffer = Arc::new(OutputBuffer::new(config.max_output_lines_per_job));
        let broadcaster = Arc::new(EventBroadcaster::new(
            config.subscriber_queue_capacity,
            config.keepalive_interval,
        ));
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("build http client");

        let core = Arc::new(Self {
            config,
            output_buffer,
            broadcaster,
            queue: queue.clone(),
            journal,
            jobs: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            http,
            archive_explorer: ArchiveExplorer::new(),
        });

        tokio::spawn(queue.run_poll_loop());
        tokio::spawn(run_admission_loop(core.clone(), admitted_rx));
        core
    }

    // ---- submission surface -------------------------------------------------

    pub async fn submit_simple(
        self: &Arc<Self>,
        command: Vec<String>,
        env: HashMap<String, String>,
        is_backup: bool,
    ) -> Result<JobId, SubmitError> {
        if command.is_empty() {
            return Err(SubmitError::EmptyCommand);
        }

        let class = if is_backup {
            JobClass::Backup
        } else {
            JobClass::Operation
        };
        let kind = if is_backup {
            JobKind::ManualBackup
        } else {
            JobKind::Check
        };
        let task = Task::new("command".to_string(), TaskParams::Raw { argv: command, env });

        let job = Job {
            id: new_job_id(),
            kind,
            status: JobStatus::Pending,
            repository_id: None,
            schedule_id: None,
            composite: false,
            tasks: vec![task],
            current_task_index: 0,
            started_at: None,
            finished_at: None,
            return_code: None,
            error: None,
            class,
        };

        Ok(self.insert_and_enqueue(job).await)
    }

    pub async fn submit_composite(
        self: &Arc<Self>,
        kind: JobKind,
        tasks: Vec<TaskDescriptor>,
        repository_id: Option<RepositoryId>,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, SubmitError> {
        if tasks.is_empty() {
            return Err(SubmitError::EmptyTaskList);
        }

        if let Some(repo_id) = &repository_id {
            let found = self
                .journal
                .load_repository(repo_id)
                .await
                .ok()
                .flatten();
            if found.is_none() {
                return Err(SubmitError::UnknownRepository(repo_id.clone()));
            }
        }

        let mut built_tasks = Vec::with_capacity(tasks.len());
        for desc in &tasks {
            let params = commands::validate_task(desc)?;
            match &params {
                TaskParams::CloudSync {
                    cloud_sync_config_id,
                } => {
                    self.check_config_enabled("cloud_sync", cloud_sync_config_id)
                        .await?
                }
                TaskParams::Notification {
                    notification_config_id,
                    ..
                } => {
                    self.check_config_enabled("notification", notification_config_id)
                        .await?
                }
                _ => {}
            }
            built_tasks.push(Task::new(desc.name.clone(), params));
        }

        let job = Job {
            id: new_job_id(),
            kind,
            status: JobStatus::Pending,
            repository_id,
            schedule_id,
            composite: true,
            tasks: built_tasks,
            current_task_index: 0,
            started_at: None,
            finished_at: None,
            return_code: None,
            error: None,
            class: JobClass::Backup,
        };

        Ok(self.insert_and_enqueue(job).await)
    }

    /// Scheduler trigger surface: an external timer source (cron) calls
    /// this with a schedule id. Loads the schedule, rejects it if
    /// disabled, expands its task templates into a composite submission.
    pub async fn fire(self: &Arc<Self>, schedule_id: &ScheduleId) -> Result<JobId, SubmitError> {
        let schedule = self
            .journal
            .load_schedule(schedule_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| SubmitError::UnknownSchedule(schedule_id.clone()))?;

        if !schedule.enabled {
            return Err(SubmitError::DisabledSchedule(schedule_id.clone()));
        }

        let tasks = schedule
            .task_templates
            .into_iter()
            .map(|t| TaskDescriptor {
                kind: t.kind,
                name: t.name,
                params: t.params,
            })
            .collect();

        self.submit_composite(
            JobKind::ScheduledBackup,
            tasks,
            Some(schedule.repository_id),
            Some(schedule.id),
        )
        .await
    }

    async fn check_config_enabled(&self, kind: &'static str, id: &str) -> Result<(), SubmitError> {
        let row = self.journal.load_config(kind, id).await.map_err(|_| {
            SubmitError::UnknownConfig {
                kind,
                id: id.to_string(),
            }
        })?;
        match row {
            None => Err(SubmitError::UnknownConfig {
                kind,
                id: id.to_string(),
            }),
            Some(row) => {
                let enabled = match row {
                    ConfigRow::Cleanup(c) => c.enabled,
                    ConfigRow::CloudSync(c) => c.enabled,
                    ConfigRow::Notification(c) => c.enabled,
                    ConfigRow::Check(c) => c.enabled,
                };
                if enabled {
                    Ok(())
                } else {
                    Err(SubmitError::DisabledConfig {
                        kind,
                        id: id.to_string(),
                    })
                }
            }
        }
    }

    async fn insert_and_enqueue(&self, job: Job) -> JobId {
        let job_id = job.id.clone();
        let class = job.class;

        self.output_buffer.create(&job_id).await;
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job_id.clone(), job);
        }
        if let Some(snapshot) = self.snapshot_locked(&job_id).await {
            let _ = self.journal.create_job_row(&snapshot).await;
        }
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(&job_id) {
                job.status = JobStatus::Queued;
            }
        }
        self.queue.enqueue(job_id.clone(), class, 0).await;
        job_id
    }

    /// Removes from queue if queued; otherwise terminates the current child
    /// process with the configured grace. A no-op on an already-terminal
    /// job.
    pub async fn cancel(self: &Arc<Self>, job_id: &JobId) -> bool {
        let (status, class) = {
            let jobs = self.jobs.read().await;
            match jobs.get(job_id) {
                Some(job) => (job.status, job.class),
                None => return false,
            }
        };
        if status.is_terminal() {
            return false;
        }

        if matches!(status, JobStatus::Pending | JobStatus::Queued)
            && self.queue.cancel_queued(job_id, class).await
        {
            self.finalize_job(job_id, JobStatus::Cancelled, None, None)
                .await;
            self.broadcaster.publish(JobEvent::JobCancelled {
                job_id: job_id.clone(),
            });
            self.schedule_cleanup(job_id.clone());
            return true;
        }

        let token = { self.cancels.lock().await.get(job_id).cloned() };
        if let Some(token) = token {
            token.request();
            return true;
        }
        false
    }

    pub async fn get_status(&self, job_id: &JobId) -> Option<crate::model::JobSnapshot> {
        self.snapshot_locked(job_id).await
    }

    pub async fn get_output(&self, job_id: &JobId, tail_n: Option<usize>) -> Option<BufferSnapshot> {
        self.output_buffer.snapshot(job_id, tail_n).await
    }

    pub async fn follow_output(&self, job_id: &JobId) -> Option<Follow> {
        self.output_buffer.follow(job_id).await
    }

    pub async fn follow_events(&self) -> SubscriberHandle {
        self.broadcaster.subscribe().await
    }

    pub fn keepalive_interval(&self) -> std::time::Duration {
        self.broadcaster.keepalive_interval()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Archive-tree browsing surface: lazily fetches and caches the listing
    /// `path` needs within `archive_name`, then returns its contents
    /// (directories first, alphabetical, case-insensitive).
    pub async fn browse_archive(
        &self,
        repository_id: &RepositoryId,
        archive_name: &str,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, ArchiveBrowseError> {
        let repo = self
            .journal
            .load_repository(repository_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ArchiveBrowseError::UnknownRepository(repository_id.clone()))?;

        self.archive_explorer
            .ensure_loaded(
                &repo.path,
                &repo.passphrase_clear,
                archive_name,
                path,
                self.config.archive_listing_timeout,
            )
            .await?;

        Ok(self
            .archive_explorer
            .get_directory_contents(&repo.path, archive_name, path)
            .await)
    }

    async fn snapshot_locked(&self, job_id: &JobId) -> Option<crate::model::JobSnapshot> {
        let job = { self.jobs.read().await.get(job_id).cloned()? };
        let progress = self
            .output_buffer
            .snapshot(job_id, Some(1))
            .await
            .and_then(|s| s.progress);
        Some(crate::model::JobSnapshot {
            id: job.id,
            kind: job.kind,
            status: job.status,
            repository_id: job.repository_id,
            schedule_id: job.schedule_id,
            composite: job.composite,
            current_task_index: job.current_task_index,
            tasks: job.tasks.iter().map(TaskSnapshot::from).collect(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            return_code: job.return_code,
            error: job.error,
            current_progress: progress,
        })
    }

    // ---- job execution --------------------------------------------------

    async fn run_job(self: Arc<Self>, job_id: JobId) {
        let class = {
            let now = Utc::now();
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.class
        };

        let token = Arc::new(CancelToken::new());
        self.cancels.lock().await.insert(job_id.clone(), token.clone());

        let _ = self
            .journal
            .update_job_status(&job_id, JobStatus::Running, None, None, None)
            .await;
        self.broadcaster.publish(JobEvent::JobStarted {
            job_id: job_id.clone(),
        });

        let outcome = self.execute_task_list(&job_id, &token).await;

        let (final_status, return_code, error) = match outcome {
            TaskListOutcome::Completed => (JobStatus::Completed, Some(0), None),
            TaskListOutcome::Failed { return_code, error } => {
                (JobStatus::Failed, Some(return_code), Some(error))
            }
            TaskListOutcome::Cancelled => (JobStatus::Cancelled, None, None),
        };

        self.finalize_job(&job_id, final_status, return_code, error)
            .await;

        match final_status {
            JobStatus::Completed => self.broadcaster.publish(JobEvent::JobCompleted {
                job_id: job_id.clone(),
            }),
            JobStatus::Failed => self.broadcaster.publish(JobEvent::JobFailed {
                job_id: job_id.clone(),
            }),
            JobStatus::Cancelled => self.broadcaster.publish(JobEvent::JobCancelled {
                job_id: job_id.clone(),
            }),
            _ => {}
        }

        self.queue.release(&job_id, class).await;
        self.schedule_cleanup(job_id);
    }

    async fn finalize_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        return_code: Option<i32>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(job_id) {
                job.status = status;
                job.finished_at = Some(now);
                job.return_code = return_code;
                job.error = error.clone();
            }
        }
        let _ = self
            .journal
            .update_job_status(job_id, status, Some(now), return_code, error)
            .await;
        self.output_buffer.mark_terminal(job_id).await;
        self.cancels.lock().await.remove(job_id);
    }

    fn schedule_cleanup(self: &Arc<Self>, job_id: JobId) {
        let core = self.clone();
        let delay = self.config.auto_cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            core.jobs.write().await.remove(&job_id);
            core.output_buffer.clear(&job_id).await;
        });
    }

    async fn execute_task_list(
        self: &Arc<Self>,
        job_id: &JobId,
        token: &Arc<CancelToken>,
    ) -> TaskListOutcome {
        let task_count = match self.jobs.read().await.get(job_id) {
            Some(job) => job.tasks.len(),
            None => return TaskListOutcome::Cancelled,
        };

        for index in 0..task_count {
            if token.is_cancelled() {
                self.skip_remaining(job_id, index).await;
                return TaskListOutcome::Cancelled;
            }

            self.set_task_running(job_id, index).await;
            self.broadcaster.publish(JobEvent::TaskStarted {
                job_id: job_id.clone(),
                task_index: index,
            });

            let outcome = self.dispatch_task(job_id, index, token).await;

            match outcome {
                TaskOutcome::Completed => {
                    self.set_task_terminal(job_id, index, TaskStatus::Completed, Some(0), None)
                        .await;
                    self.broadcaster.publish(JobEvent::TaskCompleted {
                        job_id: job_id.clone(),
                        task_index: index,
                    });
                }
                TaskOutcome::Failed { return_code, error } => {
                    self.set_task_terminal(
                        job_id,
                        index,
                        TaskStatus::Failed,
                        Some(return_code),
                        Some(error.clone()),
                    )
                    .await;
                    self.broadcaster.publish(JobEvent::TaskFailed {
                        job_id: job_id.clone(),
                        task_index: index,
                    });
                    self.skip_remaining(job_id, index + 1).await;
                    return TaskListOutcome::Failed { return_code, error };
                }
                TaskOutcome::Cancelled { return_code } => {
                    // Chosen convention (§9 open question): a task
                    // cancelled mid-run is marked `cancelled`, not
                    // `failed`, for uniformity with the job's own status.
                    self.set_task_terminal(
                        job_id,
                        index,
                        TaskStatus::Cancelled,
                        Some(return_code),
                        None,
                    )
                    .await;
                    self.skip_remaining(job_id, index + 1).await;
                    return TaskListOutcome::Cancelled;
                }
            }
        }

        TaskListOutcome::Completed
    }

    async fn dispatch_task(
        self: &Arc<Self>,
        job_id: &JobId,
        index: usize,
        token: &Arc<CancelToken>,
    ) -> TaskOutcome {
        let (params, repository_id) = {
            let jobs = self.jobs.read().await;
            let job = jobs.get(job_id).expect("job exists while running");
            (job.tasks[index].params.clone(), job.repository_id.clone())
        };

        match &params {
            TaskParams::Notification {
                notification_config_id,
                notify_on_success,
                notify_on_failure,
            } => {
                self.dispatch_notification(
                    job_id,
                    notification_config_id,
                    *notify_on_success,
                    *notify_on_failure,
                )
                .await
            }
            TaskParams::CloudSync {
                cloud_sync_config_id,
            } => {
                self.dispatch_cloud_sync(job_id, index, cloud_sync_config_id, repository_id, token)
                    .await
            }
            _ => {
                self.dispatch_process_task(job_id, index, &params, repository_id, token)
                    .await
            }
        }
    }

    async fn build_process_command(
        &self,
        params: &TaskParams,
        repository_id: Option<RepositoryId>,
    ) -> Result<commands::BuiltCommand, String> {
        match params {
            TaskParams::Raw { argv, env } => Ok(commands::BuiltCommand {
                argv: argv.clone(),
                env: env.clone(),
            }),
            TaskParams::Backup {
                source_path,
                compression,
                dry_run,
            } => {
                let repo = self.require_repo(repository_id).await?;
                let archive = commands::new_archive_name();
                Ok(commands::borg_create(
                    &repo.path,
                    &repo.passphrase_clear,
                    &archive,
                    compression,
                    source_path,
                    *dry_run,
                ))
            }
            TaskParams::Prune { .. } => {
                let repo = self.require_repo(repository_id).await?;
                Ok(commands::borg_prune(&repo.path, &repo.passphrase_clear, params))
            }
            TaskParams::Check { .. } => {
                let repo = self.require_repo(repository_id).await?;
                Ok(commands::borg_check(&repo.path, &repo.passphrase_clear, params))
            }
            TaskParams::CloudSync { .. } | TaskParams::Notification { .. } => {
                Err("dispatched via a dedicated handler, not the process executor".to_string())
            }
        }
    }

    async fn require_repo(&self, repository_id: Option<RepositoryId>) -> Result<Repository, String> {
        let id = repository_id.ok_or_else(|| "task requires a repository".to_string())?;
        match self.journal.load_repository(&id).await {
            Ok(Some(repo)) => Ok(repo),
            Ok(None) => Err(format!("unknown repository: {id}")),
            Err(err) => Err(err.0),
        }
    }

    async fn dispatch_process_task(
        self: &Arc<Self>,
        job_id: &JobId,
        index: usize,
        params: &TaskParams,
        repository_id: Option<RepositoryId>,
        token: &Arc<CancelToken>,
    ) -> TaskOutcome {
        let built = match self.build_process_command(params, repository_id).await {
            Ok(built) => built,
            Err(error) => return TaskOutcome::Failed { return_code: -1, error },
        };

        tracing::debug!(
            job_id = %job_id,
            task_index = index,
            command = %executor::format_command_for_logging(&built.argv),
            "dispatching task"
        );

        let handle = match executor::start(&built.argv, &built.env, None) {
            Ok(handle) => handle,
            Err(err) => {
                return TaskOutcome::Failed {
                    return_code: -1,
                    error: err.to_string(),
                }
            }
        };

        let outcome = self.run_and_stream(job_id, index, handle, token).await;
        if outcome.cancelled {
            return TaskOutcome::Cancelled {
                return_code: outcome.result.return_code,
            };
        }
        classify_exit(params, outcome.result)
    }

    async fn dispatch_cloud_sync(
        self: &Arc<Self>,
        job_id: &JobId,
        index: usize,
        config_id: &str,
        repository_id: Option<RepositoryId>,
        token: &Arc<CancelToken>,
    ) -> TaskOutcome {
        let repo = match self.require_repo(repository_id).await {
            Ok(repo) => repo,
            Err(error) => return TaskOutcome::Failed { return_code: -1, error },
        };
        let config = match self.journal.load_config("cloud_sync", config_id).await {
            Ok(Some(ConfigRow::CloudSync(c))) => c,
            Ok(_) => {
                return TaskOutcome::Failed {
                    return_code: -1,
                    error: format!("unknown cloud_sync config: {config_id}"),
                }
            }
            Err(err) => return TaskOutcome::Failed { return_code: -1, error: err.0 },
        };

        let built = commands::rclone_sync(&repo.path, &config.provider, &config.remote_path);
        let handle = match executor::start(&built.argv, &built.env, None) {
            Ok(handle) => handle,
            Err(err) => {
                return TaskOutcome::Failed {
                    return_code: -1,
                    error: err.to_string(),
                }
            }
        };

        let outcome = self.run_and_stream(job_id, index, handle, token).await;
        if outcome.cancelled {
            return TaskOutcome::Cancelled {
                return_code: outcome.result.return_code,
            };
        }
        if outcome.result.return_code == 0 {
            TaskOutcome::Completed
        } else {
            TaskOutcome::Failed {
                return_code: outcome.result.return_code,
                error: format!("rclone exited with status {}", outcome.result.return_code),
            }
        }
    }

    async fn dispatch_notification(
        self: &Arc<Self>,
        job_id: &JobId,
        config_id: &str,
        notify_on_success: bool,
        _notify_on_failure: bool,
    ) -> TaskOutcome {
        // By the time a notification task runs, every prior task in the
        // pipeline has already completed (a failure short-circuits before
        // reaching this task at all), so this is always the success case —
        // `notify_on_failure` can never gate a live send here, only
        // `notify_on_success` can.
        if !notify_on_success {
            return TaskOutcome::Completed;
        }

        let config = match self.journal.load_config("notification", config_id).await {
            Ok(Some(ConfigRow::Notification(c))) => c,
            Ok(_) => {
                return TaskOutcome::Failed {
                    return_code: -1,
                    error: format!("unknown notification config: {config_id}"),
                }
            }
            Err(err) => return TaskOutcome::Failed { return_code: -1, error: err.0 },
        };

        let payload = serde_json::json!({
            "job_id": job_id,
            "status": "running",
            "message": "pipeline notification",
        });

        match self.http.post(&config.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => TaskOutcome::Completed,
            Ok(resp) => TaskOutcome::Failed {
                return_code: -1,
                error: format!("webhook returned {}", resp.status()),
            },
            Err(err) => TaskOutcome::Failed {
                return_code: -1,
                error: err.to_string(),
            },
        }
    }

    /// Runs a started child to completion (or cancellation), streaming
    /// output lines into the Output Buffer and broadcasting `JOB_OUTPUT`/
    /// `TASK_PROGRESS` as they arrive.
    async fn run_and_stream(
        &self,
        job_id: &JobId,
        index: usize,
        handle: executor::Handle,
        token: &Arc<CancelToken>,
    ) -> executor::RunOutcome {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
        let on_line = move |line: &OutputLine| {
            let _ = line_tx.send(line.clone());
        };

        let latest_progress: Arc<StdMutex<Option<ProgressSnapshot>>> = Arc::new(StdMutex::new(None));
        let on_progress = {
            let broadcaster = self.broadcaster.clone();
            let job_id = job_id.clone();
            let latest_progress = latest_progress.clone();
            move |p: &ProgressSnapshot| {
                *latest_progress.lock().unwrap() = Some(p.clone());
                broadcaster.publish(JobEvent::TaskProgress {
                    job_id: job_id.clone(),
                    task_index: index,
                });
            }
        };

        let output_buffer = self.output_buffer.clone();
        let broadcaster_lines = self.broadcaster.clone();
        let job_id_lines = job_id.clone();
        let drain_task = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let progress = latest_progress.lock().unwrap().clone();
                output_buffer.append(&job_id_lines, &line, progress).await;
                broadcaster_lines.publish(JobEvent::JobOutput {
                    job_id: job_id_lines.clone(),
                    line: line.text.clone(),
                });
            }
        });

        let outcome = executor::run_cancellable(
            handle,
            on_line,
            on_progress,
            &token.notify,
            self.config.process_terminate_grace,
        )
        .await;
        let _ = drain_task.await;
        outcome
    }

    async fn set_task_running(&self, job_id: &JobId, index: usize) {
        let now = Utc::now();
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(job_id) {
                job.current_task_index = index;
                if let Some(task) = job.tasks.get_mut(index) {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(now);
                }
            }
        }
        self.sync_task_journal(job_id, index).await;
    }

    async fn set_task_terminal(
        &self,
        job_id: &JobId,
        index: usize,
        status: TaskStatus,
        return_code: Option<i32>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(job_id) {
                if let Some(task) = job.tasks.get_mut(index) {
                    task.status = status;
                    task.finished_at = Some(now);
                    task.return_code = return_code;
                    task.error = error;
                }
            }
        }
        self.sync_task_journal(job_id, index).await;
    }

    async fn skip_remaining(&self, job_id: &JobId, from_index: usize) {
        let touched: Vec<usize> = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            let mut touched = Vec::new();
            for i in from_index..job.tasks.len() {
                if job.tasks[i].status == TaskStatus::Pending {
                    job.tasks[i].status = TaskStatus::Skipped;
                    touched.push(i);
                }
            }
            touched
        };
        for i in touched {
            self.sync_task_journal(job_id, i).await;
        }
    }

    async fn sync_task_journal(&self, job_id: &JobId, index: usize) {
        let snapshot = {
            let jobs = self.jobs.read().await;
            jobs.get(job_id)
                .and_then(|j| j.tasks.get(index))
                .map(TaskSnapshot::from)
        };
        if let Some(snapshot) = snapshot {
            let _ = self.journal.upsert_task_row(job_id, index, &snapshot).await;
        }
    }
}

async fn run_admission_loop(core: Arc<Core>, mut admitted_rx: mpsc::UnboundedReceiver<JobId>) {
    while let Some(job_id) = admitted_rx.recv().await {
        tokio::spawn(core.clone().run_job(job_id));
    }
}

/// Sentinel-code policy (§7): 143 (terminated by signal) is treated as
/// success for list/info-style operations (our `Raw` task kind) but as
/// failure for backup/check/prune. All other non-zero codes are failures.
fn classify_exit(params: &TaskParams, result: executor::ProcessResult) -> TaskOutcome {
    if let Some(error) = result.error {
        return TaskOutcome::Failed {
            return_code: result.return_code,
            error,
        };
    }
    let code = result.return_code;
    if code == 0 {
        return TaskOutcome::Completed;
    }
    if code == 143 && matches!(params, TaskParams::Raw { .. }) {
        return TaskOutcome::Completed;
    }
    TaskOutcome::Failed {
        return_code: code,
        error: format!("process exited with status {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::model::{CleanupConfig, NotificationConfig};
    use std::time::Duration;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            max_output_lines_per_job: 100,
            subscriber_queue_capacity: 100,
            keepalive_interval: Duration::from_secs(30),
            queue_poll_interval: Duration::from_millis(5),
            max_concurrent_backups: 1,
            max_concurrent_operations: 1,
            auto_cleanup_delay: Duration::from_millis(20),
            process_terminate_grace: Duration::from_millis(200),
            archive_listing_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn simple_successful_job_runs_to_completion() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));
        let mut events = core.follow_events().await;

        let job_id = core
            .submit_simple(
                vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
                HashMap::new(),
                true,
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = core.get_status(&job_id).await.unwrap();
            if status.status.is_terminal() {
                assert_eq!(status.status, JobStatus::Completed);
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job never reached a terminal state");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut saw_started = false;
        let mut saw_completed = false;
        for _ in 0..50 {
            match events.recv(Duration::from_millis(50)).await {
                JobEvent::JobStarted { .. } => saw_started = true,
                JobEvent::JobCompleted { .. } => {
                    saw_completed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn composite_job_short_circuits_on_failure() {
        let journal = Arc::new(InMemoryJournal::new());
        journal.insert_repository(Repository {
            id: "repo1".to_string(),
            name: "repo1".to_string(),
            path: "/nonexistent/repo/path".to_string(),
            passphrase_clear: "secret".to_string(),
        });
        journal.insert_config(
            "notification",
            ConfigRow::Notification(NotificationConfig {
                id: "notif1".to_string(),
                enabled: true,
                webhook_url: "http://127.0.0.1:9/unreachable".to_string(),
            }),
        );
        let core = Core::start(test_config(), journal);

        let tasks = vec![
            TaskDescriptor {
                kind: "backup".to_string(),
                name: "backup".to_string(),
                params: [
                    ("source_path".to_string(), serde_json::json!("/data")),
                    ("compression".to_string(), serde_json::json!("zstd")),
                ]
                .into_iter()
                .collect(),
            },
            TaskDescriptor {
                kind: "prune".to_string(),
                name: "prune".to_string(),
                params: [("keep_daily".to_string(), serde_json::json!(7))]
                    .into_iter()
                    .collect(),
            },
            TaskDescriptor {
                kind: "check".to_string(),
                name: "check".to_string(),
                params: [("check_type".to_string(), serde_json::json!("repository_only"))]
                    .into_iter()
                    .collect(),
            },
            TaskDescriptor {
                kind: "notification".to_string(),
                name: "notify".to_string(),
                params: [
                    ("notification_config_id".to_string(), serde_json::json!("notif1")),
                    ("notify_on_success".to_string(), serde_json::json!(true)),
                    ("notify_on_failure".to_string(), serde_json::json!(true)),
                ]
                .into_iter()
                .collect(),
            },
        ];

        let job_id = core
            .submit_composite(JobKind::Composite, tasks, Some("repo1".to_string()), None)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let status = loop {
            let status = core.get_status(&job_id).await.unwrap();
            if status.status.is_terminal() {
                break status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job never reached a terminal state");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(status.status, JobStatus::Failed);
        // backup will fail too (repo path doesn't exist), so the first
        // failed task is index 0 and everything after it is skipped.
        assert_eq!(status.tasks[0].status, TaskStatus::Failed);
        for task in &status.tasks[1..] {
            assert_eq!(task.status, TaskStatus::Skipped);
        }
    }

    #[tokio::test]
    async fn cancel_while_queued_never_spawns_a_process() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));

        // Occupy the single backup slot so the next submission queues.
        let _blocker = core
            .submit_simple(
                vec!["sleep".to_string(), "1".to_string()],
                HashMap::new(),
                true,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job_id = core
            .submit_simple(
                vec!["true".to_string()],
                HashMap::new(),
                true,
            )
            .await
            .unwrap();

        let cancelled = core.cancel(&job_id).await;
        assert!(cancelled);

        let status = core.get_status(&job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);

        let stats = core.queue_stats().await;
        assert_eq!(stats.queue_size_by_class["backup"], 0);
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_is_a_noop() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));
        let job_id = core
            .submit_simple(vec!["true".to_string()], HashMap::new(), false)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if core.get_status(&job_id).await.unwrap().status.is_terminal() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job never reached a terminal state");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!core.cancel(&job_id).await);
    }

    #[tokio::test]
    async fn composite_submission_rejects_empty_task_list() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));
        let result = core
            .submit_composite(JobKind::Composite, vec![], None, None)
            .await;
        assert!(matches!(result, Err(SubmitError::EmptyTaskList)));
    }

    #[tokio::test]
    async fn submit_simple_rejects_empty_command() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));
        let result = core.submit_simple(vec![], HashMap::new(), false).await;
        assert!(matches!(result, Err(SubmitError::EmptyCommand)));
    }

    #[tokio::test]
    async fn fire_rejects_unknown_schedule() {
        let core = Core::start(test_config(), Arc::new(InMemoryJournal::new()));
        let result = core.fire(&"missing".to_string()).await;
        assert!(matches!(result, Err(SubmitError::UnknownSchedule(_))));
    }

    #[tokio::test]
    async fn fire_rejects_disabled_schedule() {
        let journal = Arc::new(InMemoryJournal::new());
        journal.insert_repository(Repository {
            id: "repo1".to_string(),
            name: "repo1".to_string(),
            path: "/nonexistent/repo/path".to_string(),
            passphrase_clear: "secret".to_string(),
        });
        journal.insert_schedule(crate::model::Schedule {
            id: "sched1".to_string(),
            cron_expression: "0 0 * * *".to_string(),
            repository_id: "repo1".to_string(),
            task_templates: vec![],
            enabled: false,
        });
        let core = Core::start(test_config(), journal);

        let result = core.fire(&"sched1".to_string()).await;
        assert!(matches!(result, Err(SubmitError::DisabledSchedule(_))));
    }

    #[tokio::test]
    async fn fire_expands_templates_into_a_scheduled_backup_job() {
        let journal = Arc::new(InMemoryJournal::new());
        journal.insert_repository(Repository {
            id: "repo1".to_string(),
            name: "repo1".to_string(),
            path: "/nonexistent/repo/path".to_string(),
            passphrase_clear: "secret".to_string(),
        });
        journal.insert_schedule(crate::model::Schedule {
            id: "sched1".to_string(),
            cron_expression: "0 0 * * *".to_string(),
            repository_id: "repo1".to_string(),
            task_templates: vec![crate::model::TaskTemplate {
                kind: "check".to_string(),
                name: "check".to_string(),
                params: [("check_type".to_string(), serde_json::json!("repository_only"))]
                    .into_iter()
                    .collect(),
            }],
            enabled: true,
        });
        let core = Core::start(test_config(), journal);

        let job_id = core.fire(&"sched1".to_string()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let status = loop {
            let status = core.get_status(&job_id).await.unwrap();
            if status.status.is_terminal() {
                break status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job never reached a terminal state");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(status.kind, JobKind::ScheduledBackup);
        assert_eq!(status.repository_id.as_deref(), Some("repo1"));
        assert_eq!(status.schedule_id.as_deref(), Some("sched1"));
    }

    #[tokio::test]
    async fn notification_task_skips_webhook_when_notify_on_success_is_false() {
        let journal = Arc::new(InMemoryJournal::new());
        journal.insert_config(
            "notification",
            ConfigRow::Notification(NotificationConfig {
                id: "notif1".to_string(),
                enabled: true,
                webhook_url: "http://127.0.0.1:9/unreachable".to_string(),
            }),
        );
        let core = Core::start(test_config(), journal);

        let tasks = vec![TaskDescriptor {
            kind: "notification".to_string(),
            name: "notify".to_string(),
            params: [
                ("notification_config_id".to_string(), serde_json::json!("notif1")),
                ("notify_on_success".to_string(), serde_json::json!(false)),
                ("notify_on_failure".to_string(), serde_json::json!(true)),
            ]
            .into_iter()
            .collect(),
        }];

        let job_id = core
            .submit_composite(JobKind::Composite, tasks, None, None)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let status = loop {
            let status = core.get_status(&job_id).await.unwrap();
            if status.status.is_terminal() {
                break status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job never reached a terminal state");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // If the gate were missing, the webhook post to an unreachable
        // address would fail the task instead.
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.tasks[0].status, TaskStatus::Completed);
    }
}
