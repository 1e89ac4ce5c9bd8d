//! MatterStack command-line interface.
//!
//! Exit codes: 0 success, 2 user error, 3 lock contention, 4 schema error,
//! 5 wiring override refused.

mod campaign_file;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use campaign_file::FileCampaign;
use matterstack_core::{EngineError, RunHandle};
use matterstack_engine::{
    build_bundle, cancel_attempt, cancel_run, export_bundle, frontier, initialize_run,
    list_active_runs, pause_run, rerun_task, resume_run, revive_run, run_until_completion,
    step_run, workspaces_root, InitOptions, StepOptions,
};
use matterstack_store::StateStore;
use matterstack_wiring::WiringRequest;

#[derive(Parser)]
#[command(name = "matterstack", about = "Persistent, tick-based campaign orchestrator")]
struct Cli {
    /// Workspaces base directory (defaults to MATTERSTACK_WORKSPACES_ROOT
    /// or ./workspaces).
    #[arg(long, global = true)]
    workspaces_root: Option<PathBuf>,

    /// Explicit operators config path (requires --force-wiring-override to
    /// replace a run's persisted snapshot).
    #[arg(long, global = true)]
    operators_config: Option<PathBuf>,

    #[arg(long, global = true)]
    force_wiring_override: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new run for a workspace.
    Init { workspace: String },
    /// Execute one tick of a run.
    Step { run_id: String },
    /// Tick a run until it reaches a terminal status (or all active runs
    /// when no run id is given).
    Loop {
        run_id: Option<String>,
        #[arg(long, default_value_t = 2.0)]
        interval_seconds: f64,
    },
    /// Show run status and task counts.
    Status { run_id: String },
    /// Explain what is blocking a run.
    Explain { run_id: String },
    Pause { run_id: String },
    Resume { run_id: String },
    Cancel {
        run_id: String,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
    /// Reset a terminal run back to RUNNING.
    Revive { run_id: String },
    /// Reset a task (and optionally dependents) for a fresh attempt.
    Rerun {
        run_id: String,
        task_id: String,
        #[arg(long)]
        recursive: bool,
    },
    /// List a task's attempt history.
    Attempts { run_id: String, task_id: String },
    CancelAttempt {
        run_id: String,
        attempt_id: String,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
    /// Build and export the evidence bundle.
    ExportEvidence { run_id: String },
}

const EXIT_USER_ERROR: u8 = 2;
const EXIT_LOCK_HELD: u8 = 3;
const EXIT_SCHEMA_ERROR: u8 = 4;
const EXIT_WIRING_REFUSED: u8 = 5;

fn exit_code_for(err: &EngineError) -> u8 {
    match err {
        EngineError::LockHeld { .. } => EXIT_LOCK_HELD,
        EngineError::SchemaVersion { .. } => EXIT_SCHEMA_ERROR,
        EngineError::WiringOverride(_) => EXIT_WIRING_REFUSED,
        EngineError::RunNotFound(_)
        | EngineError::TaskNotFound(_)
        | EngineError::AttemptNotFound(_)
        | EngineError::TerminalAttempt(_)
        | EngineError::Invalid(_) => EXIT_USER_ERROR,
        _ => 1,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Locate a run directory by id across all workspaces.
fn find_run(base: &PathBuf, run_id: &str) -> Result<RunHandle, EngineError> {
    let entries =
        std::fs::read_dir(base).map_err(|_| EngineError::RunNotFound(run_id.to_string()))?;
    for workspace in entries.flatten() {
        let candidate = workspace.path().join("runs").join(run_id);
        if candidate.join("state.db").is_file() {
            let slug = workspace.file_name().to_string_lossy().to_string();
            return Ok(RunHandle::new(slug, run_id, candidate));
        }
    }
    Err(EngineError::RunNotFound(run_id.to_string()))
}

fn run(cli: Cli) -> Result<(), EngineError> {
    let base = cli.workspaces_root.clone().unwrap_or_else(workspaces_root);

    let wiring = {
        let mut wiring = WiringRequest::new(&base);
        if let Some(path) = &cli.operators_config {
            wiring.explicit_path = Some(path.clone());
        }
        wiring.force = cli.force_wiring_override;
        wiring
    };
    let step_options = {
        let mut options = StepOptions::new();
        options.wiring = wiring.clone();
        options.actor = "cli".to_string();
        options
    };

    match cli.command {
        Command::Init { workspace } => {
            let campaign = FileCampaign::for_workspace(&base, &workspace)?;
            let options = InitOptions {
                base_path: base.clone(),
                wiring,
                ..InitOptions::new()
            };
            let handle = initialize_run(&workspace, &campaign, &options)?;
            println!("{}", handle.run_id);
            Ok(())
        }
        Command::Step { run_id } => {
            let run = find_run(&base, &run_id)?;
            let campaign = FileCampaign::for_workspace(&base, &run.workspace_slug)?;
            let status = step_run(&run, &campaign, &step_options)?;
            println!("{}", status.as_str());
            Ok(())
        }
        Command::Loop {
            run_id,
            interval_seconds,
        } => {
            let interval = Duration::from_secs_f64(interval_seconds);
            match run_id {
                Some(run_id) => {
                    let run = find_run(&base, &run_id)?;
                    let campaign = FileCampaign::for_workspace(&base, &run.workspace_slug)?;
                    let status = run_until_completion(&run, &campaign, &step_options, interval)?;
                    println!("{}", status.as_str());
                }
                None => loop {
                    let ticked = matterstack_engine::service_active_runs(
                        &base,
                        &|run| {
                            FileCampaign::for_workspace(&base, &run.workspace_slug)
                                .ok()
                                .map(|c| Box::new(c) as Box<dyn matterstack_core::Campaign>)
                        },
                        &step_options,
                    );
                    if ticked == 0 && list_active_runs(&base).is_empty() {
                        break;
                    }
                    std::thread::sleep(interval);
                },
            }
            Ok(())
        }
        Command::Status { run_id } => {
            let run = find_run(&base, &run_id)?;
            let bundle = build_bundle(&run)?;
            println!("run:       {}", bundle.run_id);
            println!("workspace: {}", bundle.workspace_slug);
            println!("status:    {}", bundle.run_status);
            if let Some(reason) = &bundle.status_reason {
                println!("reason:    {reason}");
            }
            let get = |k: &str| bundle.task_counts.get(k).copied().unwrap_or(0);
            println!(
                "tasks:     {} total, {} completed, {} failed, {} cancelled",
                get("total"),
                get("completed"),
                get("failed"),
                get("cancelled"),
            );
            Ok(())
        }
        Command::Explain { run_id } => {
            let run = find_run(&base, &run_id)?;
            let items = frontier(&run, None)?;
            if items.is_empty() {
                println!("nothing is blocking this run");
                return Ok(());
            }
            for item in items {
                println!(
                    "{}",
                    serde_json::to_string(&item)
                        .map_err(|e| EngineError::Storage(e.to_string()))?
                );
            }
            Ok(())
        }
        Command::Pause { run_id } => pause_run(&find_run(&base, &run_id)?, "cli"),
        Command::Resume { run_id } => resume_run(&find_run(&base, &run_id)?, "cli"),
        Command::Cancel { run_id, reason } => {
            cancel_run(&find_run(&base, &run_id)?, &reason, "cli")
        }
        Command::Revive { run_id } => revive_run(&find_run(&base, &run_id)?, "cli"),
        Command::Rerun {
            run_id,
            task_id,
            recursive,
        } => {
            let targets = rerun_task(&find_run(&base, &run_id)?, &task_id, recursive, "cli")?;
            for target in targets {
                println!("reset {target}");
            }
            Ok(())
        }
        Command::Attempts { run_id, task_id } => {
            let run = find_run(&base, &run_id)?;
            let store = StateStore::open(run.db_path()).map_err(EngineError::from)?;
            let attempts = store.list_attempts(&task_id).map_err(EngineError::from)?;
            if attempts.is_empty() {
                println!("no attempts for task {task_id}");
                return Ok(());
            }
            for attempt in attempts {
                println!(
                    "#{} {} {} operator={} external={}{}",
                    attempt.attempt_index,
                    attempt.attempt_id,
                    attempt.status.as_str(),
                    attempt.operator_key.as_deref().unwrap_or("-"),
                    attempt.external_id.as_deref().unwrap_or("-"),
                    attempt
                        .status_reason
                        .map(|r| format!(" reason={r:?}"))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
        Command::CancelAttempt {
            run_id,
            attempt_id,
            reason,
        } => cancel_attempt(&find_run(&base, &run_id)?, &attempt_id, None, &reason, "cli"),
        Command::ExportEvidence { run_id } => {
            let run = find_run(&base, &run_id)?;
            let bundle = build_bundle(&run)?;
            export_bundle(&bundle, &run)?;
            println!("{}", run.evidence_dir().display());
            Ok(())
        }
    }
}
