mod cli;
mod constants;
mod format;
mod shutdown;
mod terminal;
mod ui;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::info;

use borgitory_core::broadcaster::JobEvent;
use borgitory_core::journal::InMemoryJournal;
use borgitory_core::{Core, JobKind, JobSnapshot, Repository, RuntimeConfig, TaskDescriptor};

use crate::cli::Cli;
use crate::constants::TUI_REFRESH_INTERVAL_US;
use crate::format::{format_duration, job_kind_label, job_status_label, task_kind_label, task_status_label};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use crate::terminal::{TuiInputEvent, TuiTerminal};
use crate::ui::{JobRow, Ui};

fn task_descriptor(kind: &str, name: &str, params: serde_json::Value) -> TaskDescriptor {
    let params = match params {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    TaskDescriptor {
        kind: kind.to_string(),
        name: name.to_string(),
        params,
    }
}

fn job_row(snapshot: &JobSnapshot) -> JobRow {
    let task = snapshot.tasks.get(snapshot.current_task_index);
    let task_name = task
        .map(|t| task_kind_label(t.kind).to_string())
        .unwrap_or_else(|| "-".to_string());
    let detail = if snapshot.status.is_terminal() {
        match (snapshot.started_at, snapshot.finished_at) {
            (Some(start), Some(finish)) => {
                format_duration(Duration::from_secs((finish - start).num_seconds().max(0) as u64))
            }
            _ => "-".to_string(),
        }
    } else {
        task.map(|t| task_status_label(t.status).to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    JobRow {
        id: snapshot.id.chars().take(8).collect(),
        kind: job_kind_label(snapshot.kind).to_string(),
        status: job_status_label(snapshot.status).to_string(),
        task: task_name,
        detail,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::load_or_default("borgitory-demo").unwrap_or_default();
    config.max_concurrent_backups = cli.max_concurrent_backups;
    config.max_concurrent_operations = cli.max_concurrent_operations;

    let journal = Arc::new(InMemoryJournal::new());
    let repository_id = "demo".to_string();
    journal.insert_repository(Repository {
        id: repository_id.clone(),
        name: "demo".to_string(),
        path: cli.repo.display().to_string(),
        passphrase_clear: cli.passphrase.clone(),
    });

    let core = Core::start(config, journal);

    let mut tasks = vec![task_descriptor(
        "backup",
        "backup",
        json!({
            "source_path": cli.source.display().to_string(),
            "compression": cli.compression,
            "dry_run": false,
        }),
    )];
    if !cli.no_prune {
        tasks.push(task_descriptor(
            "prune",
            "prune",
            json!({
                "keep_daily": cli.keep_daily,
                "keep_weekly": cli.keep_weekly,
                "show_stats": true,
            }),
        ));
    }
    if !cli.no_check {
        tasks.push(task_descriptor(
            "check",
            "check",
            json!({ "check_type": "full" }),
        ));
    }

    let task_count = tasks.len();
    let job_id = core
        .submit_composite(JobKind::Composite, tasks, Some(repository_id), None)
        .await?;
    info!(job_id = %job_id, task_count, "submitted composite job");

    let tui_enabled = !cli.no_tui && std::io::stdout().is_terminal();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    let (input_tx, mut input_rx) = tokio::sync::mpsc::unbounded_channel::<TuiInputEvent>();
    let tui_terminal = if tui_enabled && std::io::stdin().is_terminal() {
        Some(TuiTerminal::enter(
            shutdown.clone(),
            shutdown_tx.clone(),
            input_tx,
        )?)
    } else {
        None
    };
    if tui_terminal.is_none() {
        spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);
    }

    let mut ui = if tui_enabled { Some(Ui::new()?) } else { None };

    let startup = format!("borgitory-demo {} job={job_id}", env!("CARGO_PKG_VERSION"));
    if let Some(ui) = &mut ui {
        ui.println(&startup);
    } else {
        println!("{startup}");
    }

    let mut events = core.follow_events().await;
    let keepalive_interval = core.keepalive_interval();

    let mut ticker = tokio::time::interval(Duration::from_micros(TUI_REFRESH_INTERVAL_US));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut immediate_exit = false;

    loop {
        if let Some(snapshot) = core.get_status(&job_id).await {
            if snapshot.status.is_terminal() {
                info!(job_id = %job_id, status = ?snapshot.status, "job reached terminal status");
                let line = format!(
                    "job {job_id} {}{}",
                    job_status_label(snapshot.status),
                    snapshot
                        .error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default(),
                );
                if let Some(ui) = &mut ui {
                    ui.set_jobs(vec![job_row(&snapshot)]);
                    ui.println(&line);
                } else {
                    println!("{line}");
                }
                break;
            }
        }

        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        let msg = "Stop requested — cancelling the running job (press CTRL+C again to exit immediately).";
                        if let Some(ui) = &mut ui {
                            ui.set_stop_message(msg);
                        } else {
                            eprintln!("{msg}");
                        }
                        info!(job_id = %job_id, "cancel requested from CLI");
                        core.cancel(&job_id).await;
                    }
                    Some(ShutdownEvent::Immediate) => {
                        let msg = "Stop requested again — exiting immediately.";
                        if let Some(ui) = &mut ui {
                            ui.set_stop_message(msg);
                        } else {
                            eprintln!("{msg}");
                        }
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            input = input_rx.recv(), if tui_enabled => {
                if let (Some(ev), Some(ui)) = (input, &mut ui) {
                    ui.handle_input(ev);
                }
            }
            _ = ticker.tick(), if tui_enabled => {
                if let Some(snapshot) = core.get_status(&job_id).await {
                    if let Some(ui) = &mut ui {
                        ui.set_jobs(vec![job_row(&snapshot)]);
                        let queue = core.queue_stats().await;
                        ui.tick_global(format!(
                            "borgitory-demo | job {job_id} | queued {}",
                            queue.total_queued
                        ));
                    }
                }
            }
            event = events.recv(keepalive_interval) => {
                if let JobEvent::JobOutput { job_id: jid, line } = event {
                    if jid == job_id {
                        if let Some(ui) = &mut ui {
                            ui.println(&line);
                        } else {
                            println!("{line}");
                        }
                    }
                }
            }
        }
    }

    if let Some(ui) = &mut ui {
        ui.freeze();
    }

    if immediate_exit {
        drop(tui_terminal);
        std::process::exit(130);
    }

    drop(tui_terminal);
    Ok(())
}
