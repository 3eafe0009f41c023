//! CLI command definitions for recon3d.
//!
//! The pipeline runs in the foreground; `runs` and `logs` read the
//! persisted run directories, so they work against runs from earlier
//! invocations as well.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::config::TaskConfig;
use crate::docker::{DockerClient, DockerRunner};
use crate::pipeline::RunStatus;
use crate::service::RunManager;
use crate::stages::Stage;

/// Default task configuration file, relative to the current directory.
const DEFAULT_CONFIG: &str = "config.yaml";

/// Poll interval for `logs --follow`.
const FOLLOW_POLL: Duration = Duration::from_secs(1);

/// Photogrammetry pipeline orchestrator: images to splats, meshes and
/// point clouds via containerized engines.
#[derive(Parser)]
#[command(name = "recon3d")]
#[command(about = "Run 3D reconstruction pipelines in Docker containers")]
#[command(version)]
#[command(
    long_about = "recon3d orchestrates a multi-stage 3D reconstruction pipeline (SfM, Gaussian \
splatting, meshing, point-cloud conversion), running each stage in its own Docker container.\n\n\
Example usage:\n  recon3d run --config ./scene/config.yaml\n  recon3d run --stages reconstruction --resume 20250101_120000"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the reconstruction pipeline.
    Run(RunArgs),

    /// List runs and their stage states.
    Runs(RunsArgs),

    /// Print (and optionally follow) the unified log of a run.
    Logs(LogsArgs),
}

/// Arguments for `recon3d run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: String,

    /// Comma-separated stages to run (sfm, reconstruction, mesh,
    /// point_cloud). Defaults to every stage the configuration enables.
    #[arg(short, long)]
    pub stages: Option<String>,

    /// Resume an existing run instead of creating a new run directory.
    /// Completed stages are skipped.
    #[arg(short, long)]
    pub resume: Option<String>,
}

/// Arguments for `recon3d runs`.
#[derive(Parser, Debug)]
pub struct RunsArgs {
    /// Task configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: String,
}

/// Arguments for `recon3d logs`.
#[derive(Parser, Debug)]
pub struct LogsArgs {
    /// Task configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: String,

    /// Run to read logs from. Defaults to the most recent run.
    pub run_id: Option<String>,

    /// Byte offset into the unified log to start reading from.
    #[arg(short, long, default_value = "0")]
    pub offset: u64,

    /// Keep polling for new log lines until the run finishes.
    #[arg(short, long)]
    pub follow: bool,
}

/// Parse CLI arguments without executing any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await?,
        Commands::Runs(args) => runs_command(args)?,
        Commands::Logs(args) => logs_command(args).await?,
    }
    Ok(())
}

fn parse_stages(arg: Option<&str>) -> anyhow::Result<Vec<Stage>> {
    let Some(arg) = arg else {
        return Ok(Vec::new());
    };
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Stage::from_str(s).map_err(Into::into))
        .collect()
}

fn docker_manager(config: Arc<TaskConfig>) -> anyhow::Result<RunManager> {
    let client = DockerClient::new()?;
    let runner = DockerRunner::new(client);
    let stop = runner.stop_signal();
    let tap = runner.log_tap();
    Ok(RunManager::new(config, Arc::new(runner), stop, tap))
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let config = Arc::new(TaskConfig::from_yaml_file(&args.config)?);
    let requested = parse_stages(args.stages.as_deref())?;
    let manager = docker_manager(config)?;

    let run_id = manager.start(&requested, args.resume.as_deref())?;
    info!(run_id = %run_id, "pipeline started");

    match manager.wait().await {
        Some(Ok(true)) => {
            println!("run {run_id} completed");
            Ok(())
        }
        Some(Ok(false)) => {
            let meta = manager.status(&run_id)?;
            let failed = meta
                .stages
                .iter()
                .find(|s| s.failure.is_some())
                .map(|s| {
                    format!(
                        "{}: {}",
                        s.stage,
                        s.message.as_deref().unwrap_or("unknown failure")
                    )
                })
                .unwrap_or_else(|| "unknown stage".to_string());
            anyhow::bail!("run {run_id} failed at {failed}")
        }
        Some(Err(e)) => Err(e.into()),
        None => anyhow::bail!("run {run_id} was never started"),
    }
}

fn runs_command(args: RunsArgs) -> anyhow::Result<()> {
    let config = Arc::new(TaskConfig::from_yaml_file(&args.config)?);
    let manager = docker_manager(config)?;

    let runs = manager.list_runs()?;
    if runs.is_empty() {
        println!("no runs found");
        return Ok(());
    }
    for run in runs {
        let stages: Vec<String> = run
            .stages
            .iter()
            .map(|s| format!("{}={}", s.stage, s.state))
            .collect();
        println!("{}  {}  {}", run.run_id, run.status, stages.join(" "));
    }
    Ok(())
}

async fn logs_command(args: LogsArgs) -> anyhow::Result<()> {
    let config = Arc::new(TaskConfig::from_yaml_file(&args.config)?);
    let manager = docker_manager(config)?;

    let run_id = match args.run_id {
        Some(id) => id,
        None => manager
            .list_runs()?
            .last()
            .map(|run| run.run_id.clone())
            .ok_or_else(|| anyhow::anyhow!("no runs found"))?,
    };

    let mut offset = args.offset;
    loop {
        let chunk = manager.tail_logs(&run_id, offset)?;
        if !chunk.content.is_empty() {
            print!("{}", chunk.content);
        }
        offset = chunk.next_offset;

        if !args.follow {
            break;
        }
        let status = manager.status(&run_id)?.status;
        if status != RunStatus::Running {
            // Drain whatever landed between the tail and the status read.
            let chunk = manager.tail_logs(&run_id, offset)?;
            print!("{}", chunk.content);
            break;
        }
        tokio::time::sleep(FOLLOW_POLL).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::parse_from(["recon3d", "run"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, DEFAULT_CONFIG);
                assert!(args.stages.is_none());
                assert!(args.resume.is_none());
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_all_options() {
        let cli = Cli::parse_from([
            "recon3d",
            "run",
            "--config",
            "./scene/config.yaml",
            "--stages",
            "sfm,reconstruction",
            "--resume",
            "20250101_120000",
            "--log-level",
            "debug",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, "./scene/config.yaml");
                assert_eq!(args.stages.as_deref(), Some("sfm,reconstruction"));
                assert_eq!(args.resume.as_deref(), Some("20250101_120000"));
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_logs_command_parses() {
        let cli = Cli::parse_from(["recon3d", "logs", "20250101_120000", "--follow"]);
        match cli.command {
            Commands::Logs(args) => {
                assert_eq!(args.run_id.as_deref(), Some("20250101_120000"));
                assert_eq!(args.offset, 0);
                assert!(args.follow);
            }
            _ => panic!("Expected Logs command"),
        }
    }

    #[test]
    fn test_parse_stages() {
        assert_eq!(parse_stages(None).unwrap(), Vec::<Stage>::new());
        assert_eq!(
            parse_stages(Some("sfm, reconstruction")).unwrap(),
            vec![Stage::Sfm, Stage::Reconstruction]
        );
        assert!(parse_stages(Some("sfm,bogus")).is_err());
    }
}
