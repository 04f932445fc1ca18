//! `gpu-task-launcher <TASK> [ARGS]..` resolves the task to its image, runs
//! `<TASK> [ARGS]..` inside a fresh GPU-enabled container of that image, and
//! exits with the exit code of the command.

use std::{io::IsTerminal, path::PathBuf, process::ExitCode};

use clap::Parser;
use gpu_task_launcher::{
    default_mounts_file, LaunchConfig, LaunchError, LifecycleManager, TaskCommand, TaskRegistry,
};
use owo_colors::OwoColorize;
use stacked_errors::{Result, StackableErr};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The task to run, this selects the image
    task: String,

    /// Arguments passed on to the task
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Mount manifest, defaults to `~/.gpu_task_launcher_mounts.json`
    #[arg(long, env = "GPU_TASK_MOUNTS_FILE")]
    mounts_file: Option<PathBuf>,

    /// JSON task to image table, replaces the builtin table
    #[arg(long, env = "GPU_TASK_MAP")]
    task_map: Option<PathBuf>,

    /// Docker engine endpoint
    #[arg(long, env = "DOCKER_HOST")]
    engine_host: Option<String>,

    /// Tracing filter directive
    #[arg(long, env = "GPU_TASK_LOG", default_value_t = String::from("info"))]
    verbosity: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.verbosity).stack()?)
        .with_writer(std::io::stderr)
        .init();

    let registry = if let Some(ref task_map) = args.task_map {
        TaskRegistry::from_json_file(task_map).await.stack()?
    } else {
        TaskRegistry::builtin().stack()?
    };
    let image = registry.resolve(&args.task).stack()?.clone();
    let command = TaskCommand::new(std::iter::once(args.task.clone()).chain(args.args.clone()))
        .stack()?;

    let config = LaunchConfig::new(image)
        .with_mounts_file(args.mounts_file.clone().unwrap_or_else(default_mounts_file))
        .with_engine_host(args.engine_host.clone());
    let manager = LifecycleManager::docker(config).stack()?;

    match manager.run_task(&command).await {
        Ok(exit_code) => {
            report_exit(&args.task, exit_code);
            Ok(ExitCode::from(u8::try_from(exit_code).unwrap_or(1)))
        }
        Err(LaunchError::Interrupted) => Ok(ExitCode::from(130)),
        Err(err) => Err(err).stack_err_with(|| format!("running task \"{}\"", args.task)),
    }
}

fn report_exit(task: &str, exit_code: i64) {
    let msg = format!("task {task} exited with code {exit_code}");
    if !std::io::stderr().is_terminal() {
        tracing::info!("{msg}");
    } else if exit_code == 0 {
        eprintln!("{}", msg.green());
    } else {
        eprintln!("{}", msg.red());
    }
}
