//! Process Executor (component A): spawn a child process, stream its
//! combined output back as line events, parse Borg progress lines, and
//! support forced termination.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::SpawnError;

/// Which stream a line came from. Both are interleaved into a single
/// channel in the order they were read so temporal ordering is preserved,
/// approximating the `stderr=STDOUT` duplication Borg's caller relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

/// Numeric counters and current-path parsed from a Borg progress line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub original_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub deduplicated_size: Option<u64>,
    pub nfiles: Option<u64>,
    pub path: Option<String>,
    pub archive_name: Option<String>,
    pub archive_fingerprint: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
}

impl ProgressSnapshot {
    fn merge_named_field(&mut self, line: &str) {
        let Some((label, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim().to_string();
        match label.trim() {
            "Archive name" => self.archive_name = Some(value),
            "Archive fingerprint" => self.archive_fingerprint = Some(value),
            "Time (start)" => self.time_start = Some(value),
            "Time (end)" => self.time_end = Some(value),
            _ => {}
        }
    }
}

/// Parses the five-field Borg progress line `<orig> <comp> <dedup> <nfiles>
/// <path>` (first four integers). Returns `None` if the line does not match.
pub fn parse_progress_line(line: &str) -> Option<ProgressSnapshot> {
    let mut fields = line.splitn(5, char::is_whitespace);
    let original_size: u64 = fields.next()?.parse().ok()?;
    let compressed_size: u64 = fields.next()?.parse().ok()?;
    let deduplicated_size: u64 = fields.next()?.parse().ok()?;
    let nfiles: u64 = fields.next()?.parse().ok()?;
    let path = fields.next()?.to_string();
    if path.is_empty() {
        return None;
    }
    Some(ProgressSnapshot {
        original_size: Some(original_size),
        compressed_size: Some(compressed_size),
        deduplicated_size: Some(deduplicated_size),
        nfiles: Some(nfiles),
        path: Some(path),
        ..Default::default()
    })
}

/// A single decoded output line delivered to a monitor callback.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub text: String,
    pub tag: StreamTag,
}

/// Final outcome of [`monitor`]. The return code is always the result —
/// a non-zero exit never raises.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub return_code: i32,
    pub error: Option<String>,
}

/// A running (or just-finished) child process.
pub struct Handle {
    pub pid: Option<u32>,
    child: Child,
    lines: mpsc::Receiver<OutputLine>,
}

/// Spawn `command` with `env_overlay` applied on top of the ambient
/// environment (overlay wins), optionally in `cwd`. Fails with
/// [`SpawnError`] if the binary cannot be executed.
pub fn start(
    command: &[String],
    env_overlay: &HashMap<String, String>,
    cwd: Option<&str>,
) -> Result<Handle, SpawnError> {
    let (program, args) = command
        .split_first()
        .expect("caller validates non-empty command");

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.envs(env_overlay.iter());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(pump_lines(stdout, StreamTag::Stdout, tx.clone()));
    tokio::spawn(pump_lines(stderr, StreamTag::Stderr, tx));

    Ok(Handle {
        pid,
        child,
        lines: rx,
    })
}

async fn pump_lines<R>(reader: R, tag: StreamTag, tx: mpsc::Sender<OutputLine>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if tx.send(OutputLine { text, tag }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(?tag, %err, "error reading child output");
                break;
            }
        }
    }
}

/// Consume output until EOF and the child exits. Every decoded line is
/// delivered to `on_line`; lines matching the Borg progress format are
/// additionally parsed and delivered to `on_progress`.
pub async fn monitor<FLine, FProgress>(
    mut handle: Handle,
    mut on_line: FLine,
    mut on_progress: FProgress,
) -> ProcessResult
where
    FLine: FnMut(&OutputLine),
    FProgress: FnMut(&ProgressSnapshot),
{
    let mut progress = ProgressSnapshot::default();

    while let Some(line) = handle.lines.recv().await {
        on_line(&line);
        if let Some(parsed) = parse_progress_line(&line.text) {
            progress = parsed;
            on_progress(&progress);
        } else {
            progress.merge_named_field(&line.text);
        }
    }

    match handle.child.wait().await {
        Ok(status) => ProcessResult {
            return_code: status.code().unwrap_or(-1),
            error: None,
        },
        Err(err) => ProcessResult {
            return_code: -1,
            error: Some(format!("failed waiting on child: {err}")),
        },
    }
}

/// Outcome of [`run_cancellable`].
pub struct RunOutcome {
    pub result: ProcessResult,
    pub cancelled: bool,
}

/// Like [`monitor`], but races output consumption against a cancellation
/// signal. When cancelled, terminates the child (polite then forced after
/// `grace`), drains any already-buffered lines, and returns promptly
/// instead of waiting for natural EOF.
pub async fn run_cancellable<FLine, FProgress>(
    mut handle: Handle,
    mut on_line: FLine,
    mut on_progress: FProgress,
    cancel: &tokio::sync::Notify,
    grace: Duration,
) -> RunOutcome
where
    FLine: FnMut(&OutputLine),
    FProgress: FnMut(&ProgressSnapshot),
{
    let mut progress = ProgressSnapshot::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.notified() => {
                terminate(&mut handle, grace).await;
                while let Ok(line) = handle.lines.try_recv() {
                    on_line(&line);
                }
                let return_code = match handle.child.try_wait() {
                    Ok(Some(status)) => status.code().unwrap_or(-1),
                    _ => -1,
                };
                return RunOutcome {
                    result: ProcessResult { return_code, error: None },
                    cancelled: true,
                };
            }
            line_opt = handle.lines.recv() => {
                match line_opt {
                    Some(line) => {
                        on_line(&line);
                        if let Some(parsed) = parse_progress_line(&line.text) {
                            progress = parsed;
                            on_progress(&progress);
                        } else {
                            progress.merge_named_field(&line.text);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let result = match handle.child.wait().await {
        Ok(status) => ProcessResult {
            return_code: status.code().unwrap_or(-1),
            error: None,
        },
        Err(err) => ProcessResult {
            return_code: -1,
            error: Some(format!("failed waiting on child: {err}")),
        },
    };
    RunOutcome { result, cancelled: false }
}

/// Send a polite termination signal; after `grace` with no exit, force-kill.
/// Idempotent; a no-op if the child has already exited.
pub async fn terminate(handle: &mut Handle, grace: Duration) {
    let Some(pid) = handle.pid else {
        return;
    };

    if let Ok(Some(_)) = handle.child.try_wait() {
        return;
    }

    // SAFETY: `pid` is this process's own child; SIGTERM is a request, not
    // destructive to anything outside it.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }

    let waited = tokio::time::timeout(grace, handle.child.wait()).await;
    if waited.is_err() {
        let _ = handle.child.start_kill();
        let _ = handle.child.wait().await;
    }
}

/// Redacts sensitive arguments (passphrases, `repo::archive` specifiers)
/// before a command line is logged.
pub fn format_command_for_logging(command: &[String]) -> String {
    const SENSITIVE_FLAGS: &[&str] = &["-p", "--passphrase", "--encryption-passphrase"];
    let archive_specifier = regex::Regex::new(r"^[^:]+::.+$").expect("valid regex");

    let mut out = Vec::with_capacity(command.len());
    let mut redact_next = false;
    for arg in command {
        if redact_next {
            out.push("[REDACTED]".to_string());
            redact_next = false;
            continue;
        }
        if SENSITIVE_FLAGS.contains(&arg.as_str()) {
            out.push(arg.clone());
            redact_next = true;
            continue;
        }
        if archive_specifier.is_match(arg) {
            let repo = arg.split("::").next().unwrap_or(arg);
            out.push(format!("{repo}::[ARCHIVE]"));
            continue;
        }
        out.push(arg.clone());
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        let snap = parse_progress_line("123 456 78 9 /data/a").unwrap();
        assert_eq!(snap.original_size, Some(123));
        assert_eq!(snap.compressed_size, Some(456));
        assert_eq!(snap.deduplicated_size, Some(78));
        assert_eq!(snap.nfiles, Some(9));
        assert_eq!(snap.path.as_deref(), Some("/data/a"));
    }

    #[test]
    fn rejects_non_progress_line() {
        assert!(parse_progress_line("Archive name: backup-20260101-000000").is_none());
        assert!(parse_progress_line("not a progress line at all").is_none());
    }

    #[test]
    fn named_fields_merge_into_snapshot() {
        let mut snap = ProgressSnapshot::default();
        snap.merge_named_field("Archive name: backup-20260101-000000");
        snap.merge_named_field("Time (start): Thu, 2026-01-01 00:00:00");
        assert_eq!(snap.archive_name.as_deref(), Some("backup-20260101-000000"));
        assert_eq!(
            snap.time_start.as_deref(),
            Some("Thu, 2026-01-01 00:00:00")
        );
    }

    #[test]
    fn redacts_passphrase_flag() {
        let cmd = vec![
            "borg".to_string(),
            "init".to_string(),
            "--encryption".to_string(),
            "repokey".to_string(),
            "-p".to_string(),
            "hunter2".to_string(),
            "/data/repo".to_string(),
        ];
        let logged = format_command_for_logging(&cmd);
        assert!(!logged.contains("hunter2"));
        assert!(logged.contains("[REDACTED]"));
    }

    #[test]
    fn redacts_archive_specifier() {
        let cmd = vec![
            "borg".to_string(),
            "list".to_string(),
            "--json-lines".to_string(),
            "/data/repo::backup-20260101-000000".to_string(),
        ];
        let logged = format_command_for_logging(&cmd);
        assert!(logged.contains("/data/repo::[ARCHIVE]"));
        assert!(!logged.contains("backup-20260101-000000"));
    }

    #[tokio::test]
    async fn start_monitor_terminate_round_trip() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 1 2 3 4 /a/b; echo done 1>&2".to_string(),
        ];
        let handle = start(&command, &HashMap::new(), None).expect("spawn sh");

        let mut lines = Vec::new();
        let mut progress = None;
        let result = monitor(
            handle,
            |line| lines.push(line.text.clone()),
            |p| progress = Some(p.clone()),
        )
        .await;

        assert_eq!(result.return_code, 0);
        assert!(lines.iter().any(|l| l == "done"));
        assert!(progress.is_some());
    }

    #[tokio::test]
    async fn cancellation_force_kills_unresponsive_child() {
        let command = vec!["sleep".to_string(), "30".to_string()];
        let handle = start(&command, &HashMap::new(), None).expect("spawn sleep");
        let cancel = tokio::sync::Notify::new();
        cancel.notify_one();

        let outcome = run_cancellable(handle, |_| {}, |_| {}, &cancel, Duration::from_millis(50)).await;
        assert!(outcome.cancelled);
    }
}
