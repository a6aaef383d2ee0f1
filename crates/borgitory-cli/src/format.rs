//! Small display-formatting helpers for the dashboard and plain-text log.

use std::time::Duration;

use borgitory_core::{JobKind, JobStatus, TaskKind, TaskStatus};

pub(crate) fn job_kind_label(kind: JobKind) -> &'static str {
    match kind {
        JobKind::ManualBackup => "manual-backup",
        JobKind::ScheduledBackup => "scheduled-backup",
        JobKind::Prune => "prune",
        JobKind::Check => "check",
        JobKind::CloudSync => "cloud-sync",
        JobKind::Composite => "composite",
    }
}

pub(crate) fn job_status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

pub(crate) fn task_kind_label(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Backup => "backup",
        TaskKind::Prune => "prune",
        TaskKind::Check => "check",
        TaskKind::CloudSync => "cloud_sync",
        TaskKind::Notification => "notification",
        TaskKind::Raw => "command",
    }
}

pub(crate) fn task_status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Skipped => "skipped",
    }
}

/// `H:MM:SS`, dropping the hours field when it's zero.
pub(crate) fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Binary-unit byte count, e.g. `1.5 GiB`.
pub(crate) fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
