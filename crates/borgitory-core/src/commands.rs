//! Command construction for the external `borg` and `rclone` binaries, and
//! submission-time validation of task parameters. These are the only wire
//! formats the core depends on (§6).

use std::collections::HashMap;

use chrono::Utc;

use crate::error::SubmitError;
use crate::model::{TaskDescriptor, TaskKind, TaskParams};

fn get_str(params: &TaskDescriptor, field: &'static str) -> Result<String, SubmitError> {
    params
        .params
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or(SubmitError::MissingParam {
            task: params.name.clone(),
            field,
        })
}

fn get_bool(params: &TaskDescriptor, field: &str) -> bool {
    params
        .params
        .get(field)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn get_u32(params: &TaskDescriptor, field: &str) -> Option<u32> {
    params.params.get(field).and_then(|v| v.as_u64()).map(|v| v as u32)
}

fn get_u64(params: &TaskDescriptor, field: &str) -> Option<u64> {
    params.params.get(field).and_then(|v| v.as_u64())
}

fn get_string_opt(params: &TaskDescriptor, field: &str) -> Option<String> {
    params.params.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

/// Validates a raw [`TaskDescriptor`] into parsed [`TaskParams`]. Unknown
/// task kinds and missing required parameters fail the whole submission
/// before anything starts.
pub fn validate_task(desc: &TaskDescriptor) -> Result<TaskParams, SubmitError> {
    let kind = TaskKind::parse(&desc.kind).ok_or_else(|| SubmitError::UnknownTaskKind(desc.kind.clone()))?;

    Ok(match kind {
        TaskKind::Backup => TaskParams::Backup {
            source_path: get_str(desc, "source_path")?,
            compression: get_str(desc, "compression")?,
            dry_run: get_bool(desc, "dry_run"),
        },
        TaskKind::Prune => {
            let keep_within_days = get_u32(desc, "keep_within_days");
            let keep_daily = get_u32(desc, "keep_daily");
            let keep_weekly = get_u32(desc, "keep_weekly");
            let keep_monthly = get_u32(desc, "keep_monthly");
            let keep_yearly = get_u32(desc, "keep_yearly");
            let any_keep_n =
                keep_daily.is_some() || keep_weekly.is_some() || keep_monthly.is_some() || keep_yearly.is_some();
            if keep_within_days.is_none() && !any_keep_n {
                return Err(SubmitError::MissingParam {
                    task: desc.name.clone(),
                    field: "keep_within_days",
                });
            }
            TaskParams::Prune {
                keep_within_days,
                keep_daily,
                keep_weekly,
                keep_monthly,
                keep_yearly,
                dry_run: get_bool(desc, "dry_run"),
                show_list: get_bool(desc, "show_list"),
                show_stats: get_bool(desc, "show_stats"),
                save_space: get_bool(desc, "save_space"),
                force_prune: get_bool(desc, "force_prune"),
            }
        }
        TaskKind::Check => TaskParams::Check {
            check_type: get_str(desc, "check_type")?,
            verify_data: get_bool(desc, "verify_data"),
            repair_mode: get_bool(desc, "repair_mode"),
            save_space: get_bool(desc, "save_space"),
            max_duration: get_u64(desc, "max_duration"),
            archive_prefix: get_string_opt(desc, "archive_prefix"),
            archive_glob: get_string_opt(desc, "archive_glob"),
            first_n_archives: get_u32(desc, "first_n_archives"),
            last_n_archives: get_u32(desc, "last_n_archives"),
        },
        TaskKind::CloudSync => TaskParams::CloudSync {
            cloud_sync_config_id: get_str(desc, "cloud_sync_config_id")?,
        },
        TaskKind::Notification => TaskParams::Notification {
            notification_config_id: get_str(desc, "notification_config_id")?,
            notify_on_success: get_bool(desc, "notify_on_success"),
            notify_on_failure: get_bool(desc, "notify_on_failure"),
        },
    })
}

/// A built command plus its environment overlay, ready for the Process
/// Executor.
pub struct BuiltCommand {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

fn base_borg_env(passphrase: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("BORG_PASSPHRASE".to_string(), passphrase.to_string());
    env.insert(
        "BORG_RELOCATED_REPO_ACCESS_IS_OK".to_string(),
        "yes".to_string(),
    );
    env
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `borg init --encryption <mode> <repo_path>`.
pub fn borg_init(repo_path: &str, encryption_mode: &str, passphrase: &str) -> BuiltCommand {
    BuiltCommand {
        argv: argv(&["borg", "init", "--encryption", encryption_mode, repo_path]),
        env: base_borg_env(passphrase),
    }
}

/// Archive name format `backup-YYYYMMDD-HHMMSS`.
pub fn new_archive_name() -> String {
    format!("backup-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

/// `borg create --stats --progress --json --compression=<comp> [--dry-run]
/// <repo>::<archive_name> <source_path>`.
pub fn borg_create(
    repo_path: &str,
    passphrase: &str,
    archive_name: &str,
    compression: &str,
    source_path: &str,
    dry_run: bool,
) -> BuiltCommand {
    let mut v = vec![
        "borg".to_string(),
        "create".to_string(),
        "--stats".to_string(),
        "--progress".to_string(),
        "--json".to_string(),
        format!("--compression={compression}"),
    ];
    if dry_run {
        v.push("--dry-run".to_string());
    }
    v.push(format!("{repo_path}::{archive_name}"));
    v.push(source_path.to_string());
    BuiltCommand {
        argv: v,
        env: base_borg_env(passphrase),
    }
}

/// `borg list --json <repo>`.
pub fn borg_list_archives(repo_path: &str, passphrase: &str) -> BuiltCommand {
    BuiltCommand {
        argv: argv(&["borg", "list", "--json", repo_path]),
        env: base_borg_env(passphrase),
    }
}

/// `borg list --json-lines <repo>::<archive>`, optionally restricted to the
/// immediate children of `dir_path` via a pattern filter.
pub fn borg_list_archive_contents(
    repo_path: &str,
    passphrase: &str,
    archive_name: &str,
    dir_path: Option<&str>,
) -> BuiltCommand {
    let mut v = vec!["borg".to_string(), "list".to_string(), "--json-lines".to_string()];
    if let Some(dir_path) = dir_path {
        let escaped = regex::escape(dir_path);
        v.push("--pattern".to_string());
        v.push(format!("+ re:^{escaped}/[^/]+/?$"));
        v.push("--pattern".to_string());
        v.push("- *".to_string());
    }
    v.push(format!("{repo_path}::{archive_name}"));
    BuiltCommand {
        argv: v,
        env: base_borg_env(passphrase),
    }
}

/// `borg info --json <repo>`.
pub fn borg_info(repo_path: &str, passphrase: &str) -> BuiltCommand {
    BuiltCommand {
        argv: argv(&["borg", "info", "--json", repo_path]),
        env: base_borg_env(passphrase),
    }
}

/// `borg prune [...] <repo>`.
pub fn borg_prune(repo_path: &str, passphrase: &str, params: &TaskParams) -> BuiltCommand {
    let TaskParams::Prune {
        keep_within_days,
        keep_daily,
        keep_weekly,
        keep_monthly,
        keep_yearly,
        dry_run,
        show_list,
        show_stats,
        save_space,
        force_prune,
    } = params
    else {
        panic!("borg_prune called with non-Prune params");
    };

    let mut v = vec!["borg".to_string(), "prune".to_string()];
    if let Some(days) = keep_within_days {
        v.push("--keep-within".to_string());
        v.push(format!("{days}d"));
    }
    if let Some(n) = keep_daily {
        v.push("--keep-daily".to_string());
        v.push(n.to_string());
    }
    if let Some(n) = keep_weekly {
        v.push("--keep-weekly".to_string());
        v.push(n.to_string());
    }
    if let Some(n) = keep_monthly {
        v.push("--keep-monthly".to_string());
        v.push(n.to_string());
    }
    if let Some(n) = keep_yearly {
        v.push("--keep-yearly".to_string());
        v.push(n.to_string());
    }
    if *show_stats {
        v.push("--stats".to_string());
    }
    if *show_list {
        v.push("--list".to_string());
    }
    if *save_space {
        v.push("--save-space".to_string());
    }
    if *force_prune {
        v.push("--force".to_string());
    }
    if *dry_run {
        v.push("--dry-run".to_string());
    }
    v.push(repo_path.to_string());
    BuiltCommand {
        argv: v,
        env: base_borg_env(passphrase),
    }
}

/// `borg check [...] <repo>`.
pub fn borg_check(repo_path: &str, passphrase: &str, params: &TaskParams) -> BuiltCommand {
    let TaskParams::Check {
        check_type,
        verify_data,
        repair_mode,
        save_space,
        max_duration,
        archive_prefix,
        archive_glob,
        first_n_archives,
        last_n_archives,
    } = params
    else {
        panic!("borg_check called with non-Check params");
    };

    let mut v = vec!["borg".to_string(), "check".to_string()];
    match check_type.as_str() {
        "repository_only" => v.push("--repository-only".to_string()),
        "archives_only" => v.push("--archives-only".to_string()),
        _ => {}
    }
    if *verify_data {
        v.push("--verify-data".to_string());
    }
    if *repair_mode {
        v.push("--repair".to_string());
    }
    if *save_space {
        v.push("--save-space".to_string());
    }
    if let Some(max_duration) = max_duration {
        v.push("--max-duration".to_string());
        v.push(max_duration.to_string());
    }
    if let Some(prefix) = archive_prefix {
        v.push("--prefix".to_string());
        v.push(prefix.clone());
    }
    if let Some(glob) = archive_glob {
        v.push("--glob-archives".to_string());
        v.push(glob.clone());
    }
    if let Some(n) = first_n_archives {
        v.push("--first".to_string());
        v.push(n.to_string());
    }
    if let Some(n) = last_n_archives {
        v.push("--last".to_string());
        v.push(n.to_string());
    }
    v.push(repo_path.to_string());
    BuiltCommand {
        argv: v,
        env: base_borg_env(passphrase),
    }
}

/// `rclone sync <repo_path> <remote>:<remote_path> --log-level INFO
/// --use-json-log`. Rclone emits line-oriented JSON log records that the
/// executor's caller parses into `{type: log|error|completed, ...}`.
pub fn rclone_sync(repo_path: &str, remote_name: &str, remote_path: &str) -> BuiltCommand {
    BuiltCommand {
        argv: vec![
            "rclone".to_string(),
            "sync".to_string(),
            repo_path.to_string(),
            format!("{remote_name}:{remote_path}"),
            "--log-level".to_string(),
            "INFO".to_string(),
            "--use-json-log".to_string(),
        ],
        env: HashMap::new(),
    }
}

/// `borg extract --stdout <repo>::<archive> <path>`.
pub fn borg_extract(repo_path: &str, passphrase: &str, archive_name: &str, path: &str) -> BuiltCommand {
    BuiltCommand {
        argv: vec![
            "borg".to_string(),
            "extract".to_string(),
            "--stdout".to_string(),
            format!("{repo_path}::{archive_name}"),
            path.to_string(),
        ],
        env: base_borg_env(passphrase),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(kind: &str, params: serde_json::Value) -> TaskDescriptor {
        TaskDescriptor {
            kind: kind.to_string(),
            name: format!("{kind}-task"),
            params: params
                .as_object()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let desc = descriptor("teleport", json!({}));
        assert!(matches!(
            validate_task(&desc),
            Err(SubmitError::UnknownTaskKind(_))
        ));
    }

    #[test]
    fn prune_without_retention_param_is_rejected() {
        let desc = descriptor("prune", json!({}));
        assert!(matches!(
            validate_task(&desc),
            Err(SubmitError::MissingParam { field: "keep_within_days", .. })
        ));
    }

    #[test]
    fn prune_with_keep_daily_is_accepted() {
        let desc = descriptor("prune", json!({ "keep_daily": 7 }));
        assert!(validate_task(&desc).is_ok());
    }

    #[test]
    fn backup_command_shape() {
        let cmd = borg_create("/repo", "secret", "backup-20260101-000000", "zstd", "/data", false);
        assert_eq!(
            cmd.argv,
            vec![
                "borg", "create", "--stats", "--progress", "--json", "--compression=zstd",
                "/repo::backup-20260101-000000", "/data",
            ]
        );
        assert_eq!(cmd.env.get("BORG_PASSPHRASE").unwrap(), "secret");
    }

    #[test]
    fn targeted_listing_uses_escaped_pattern() {
        let cmd = borg_list_archive_contents("/repo", "secret", "arch", Some("home/a+b"));
        assert!(cmd.argv.contains(&"--pattern".to_string()));
        assert!(cmd.argv.iter().any(|a| a.contains("home/a\\+b")));
    }
}
