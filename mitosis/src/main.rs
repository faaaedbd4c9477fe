//! `mitosis` command-line interface.
//!
//! Plans and runs tasks in-process against the configured store. Results go
//! to stdout as JSON; diagnostics go to stderr through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mitosis::exit_codes;
use mitosis::io::config::{DEFAULT_CONFIG_FILE, MitosisConfig, load_config, write_config};
use mitosis::logging;
use mitosis::services::Services;
use mitosis::task::TaskStatus;
use mitosis::worker::DriveStop;

#[derive(Parser)]
#[command(name = "mitosis", version, about = "Plan and run tasks with bounded step retries")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the plan generated for a request, without creating a task.
    Plan { title: String },
    /// Create a task for a request and drive it to a terminal status.
    Run {
        message: String,
        /// Reuse (and replace) this task id.
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Print a task's status view.
    Status { task_id: String },
    /// Fail steps left `executing` by a crashed process and resume their tasks.
    Recover,
    /// Delete finished tasks older than the retention window.
    Cleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Print the effective configuration.
    Config {
        /// Also write it back to the config file (env overrides included).
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init(logging::CLI_FILTER, config.debug);

    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(dispatch(cli.command, &cli.config, config))
}

async fn dispatch(command: Command, config_path: &Path, config: MitosisConfig) -> Result<i32> {
    match command {
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config).context("serialize config")?);
            if write {
                write_config(config_path, &config)?;
            }
            Ok(exit_codes::OK)
        }
        Command::Plan { title } => cmd_plan(config, &title).await,
        Command::Run { message, task_id } => cmd_run(config, &message, task_id).await,
        Command::Status { task_id } => cmd_status(config, &task_id).await,
        Command::Recover => cmd_recover(config).await,
        Command::Cleanup { retention_days } => cmd_cleanup(config, retention_days).await,
    }
}

async fn cmd_plan(config: MitosisConfig, title: &str) -> Result<i32> {
    let services = Services::build(config).await?;
    let draft = services.planner.generate(title).await;
    print_json(&draft)?;
    Ok(exit_codes::OK)
}

async fn cmd_run(config: MitosisConfig, message: &str, task_id: Option<String>) -> Result<i32> {
    let services = Services::build(config).await?;
    let (task, _) = services
        .create_planned_task(message, task_id)
        .await
        .context("create task")?;

    let mut subscription = services.events.connect();
    let connection = subscription.id;
    services
        .events
        .subscribe(connection, &task.task_id)
        .context("subscribe to task events")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }
    });

    let outcome = services.worker.run(&task.task_id).await;
    services.events.disconnect(connection);
    let _ = printer.await;
    let outcome = outcome.context("drive task")?;

    let view = services.engine.get_task_status(&task.task_id).await?;
    print_json(&view)?;
    Ok(match outcome.stop {
        DriveStop::Finished(TaskStatus::Completed) => exit_codes::OK,
        DriveStop::Cancelled => exit_codes::CANCELLED,
        DriveStop::Finished(_) | DriveStop::Busy { .. } => exit_codes::TASK_FAILED,
    })
}

async fn cmd_status(config: MitosisConfig, task_id: &str) -> Result<i32> {
    let services = Services::build(config).await?;
    let view = services.engine.get_task_status(task_id).await?;
    print_json(&view)?;
    Ok(exit_codes::OK)
}

async fn cmd_recover(config: MitosisConfig) -> Result<i32> {
    let services = Services::build(config).await?;
    let report = services.engine.recover_incomplete_tasks().await?;
    for task_id in &report.requeue {
        let outcome = services.worker.run(task_id).await?;
        tracing::info!(task_id, stop = ?outcome.stop, "resumed task");
    }
    print_json(&RecoverSummary {
        scanned: report.scanned,
        interrupted_steps: report.interrupted_steps,
        resumed: report.requeue,
    })?;
    Ok(exit_codes::OK)
}

async fn cmd_cleanup(config: MitosisConfig, retention_days: Option<u32>) -> Result<i32> {
    let days = retention_days.unwrap_or(config.retention.days);
    let services = Services::build(config).await?;
    let removed = services.engine.cleanup_expired(days).await?;
    print_json(&serde_json::json!({ "removed": removed, "retention_days": days }))?;
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct RecoverSummary {
    scanned: usize,
    interrupted_steps: usize,
    resumed: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_task_id() {
        let cli = Cli::parse_from(["mitosis", "run", "research rust", "--task-id", "t1"]);
        assert!(matches!(
            cli.command,
            Command::Run { ref message, task_id: Some(ref id) } if message == "research rust" && id == "t1"
        ));
    }

    #[test]
    fn config_flag_defaults_to_local_file() {
        let cli = Cli::parse_from(["mitosis", "config"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(cli.command, Command::Config { write: false }));
    }

    #[test]
    fn parse_cleanup_override() {
        let cli = Cli::parse_from(["mitosis", "cleanup", "--retention-days", "7"]);
        assert!(matches!(cli.command, Command::Cleanup { retention_days: Some(7) }));
    }
}
