use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use ralph::config::Config;
use ralph::core::task::TaskId;
use ralph::log::LogMode;
use ralph::orchestration::runner::{cancel_wave, list_waves, wave_status};
use ralph::orchestration::{WaveEvent, WaveRunner};
use ralph::state::WaveState;
use ralph::{rlog, Error, Result};

/// Ralph - dependency-aware parallel implement/review task orchestrator
#[derive(Parser, Debug)]
#[command(name = "ralph")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RALPH_DEBUG=1       Enable debug logging (alternative to --debug)\n    RALPH_LOG=<level>   Log level: error, warn, info, debug, trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.ralph/ralph.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.ralph/ralph.toml)
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a wave over the given tasks and run it to completion
    Start {
        /// Task ids to include
        task_ids: Vec<String>,

        /// Include every task filed under this epic
        #[arg(long)]
        epic: Option<String>,

        /// Workers per batch (default from config)
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Name the wave instead of generating an id
        #[arg(long)]
        wave_id: Option<String>,

        /// Repository to work in (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Print the layers a wave would run, without running anything
    Plan {
        task_ids: Vec<String>,

        #[arg(long)]
        epic: Option<String>,

        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Show layer progress and per-task state for a wave
    Status {
        wave_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continue an interrupted, cancelled, or failed wave
    Resume {
        wave_id: String,

        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Stop a wave from dispatching further work
    Cancel { wave_id: String },

    /// List known waves
    Waves,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mode = match &cli.command {
        Command::Start { .. } | Command::Resume { .. } => LogMode::Truncate,
        _ => LogMode::Append,
    };
    ralph::log::init(cli.debug, mode);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Start {
            task_ids,
            epic,
            max_parallel,
            wave_id,
            repo,
        } => run_start(config, task_ids, epic, max_parallel, wave_id, repo),
        Command::Plan {
            task_ids,
            epic,
            repo,
        } => run_plan(config, task_ids, epic, repo),
        Command::Status { wave_id, json } => run_status(config, &wave_id, json),
        Command::Resume { wave_id, repo } => run_resume(config, &wave_id, repo),
        Command::Cancel { wave_id } => run_cancel(config, &wave_id),
        Command::Waves => run_waves(config),
    }
}

fn repo_path(repo: Option<PathBuf>) -> Result<PathBuf> {
    match repo {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()?),
    }
}

/// Explicit ids plus the epic's children, in that order.
async fn collect_task_ids(
    runner: &WaveRunner,
    task_ids: Vec<String>,
    epic: Option<String>,
) -> Result<Vec<TaskId>> {
    let mut ids: Vec<TaskId> = task_ids.into_iter().map(TaskId::from).collect();
    if let Some(epic) = epic {
        ids.extend(runner.expand_epic(&TaskId::from(epic)).await?);
    }
    if ids.is_empty() {
        return Err(Error::Validation(
            "Give at least one task id or --epic".to_string(),
        ));
    }
    Ok(ids)
}

/// Print wave events as they arrive.
fn spawn_event_printer() -> (mpsc::Sender<WaveEvent>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WaveEvent>(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("  {}", event);
        }
    });
    (tx, handle)
}

fn run_start(
    config: Config,
    task_ids: Vec<String>,
    epic: Option<String>,
    max_parallel: Option<usize>,
    wave_id: Option<String>,
    repo: Option<PathBuf>,
) -> Result<()> {
    let repo = repo_path(repo)?;
    rlog!("Start command: repo={}", repo.display());

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt.block_on(async {
        let (tx, printer) = spawn_event_printer();
        let runner = WaveRunner::from_config(config, &repo)?.with_events(tx);
        let ids = collect_task_ids(&runner, task_ids, epic).await?;
        let wave_id = runner.start(&ids, max_parallel, wave_id.as_deref()).await?;
        let status = runner.status(&wave_id);
        drop(runner);
        let _ = printer.await;
        status
    })?;

    println!();
    print!("{}", status);
    finish(status.state)
}

fn run_plan(
    config: Config,
    task_ids: Vec<String>,
    epic: Option<String>,
    repo: Option<PathBuf>,
) -> Result<()> {
    let repo = repo_path(repo)?;
    let rt = tokio::runtime::Runtime::new()?;
    let schedule = rt.block_on(async {
        let runner = WaveRunner::from_config(config, &repo)?;
        let ids = collect_task_ids(&runner, task_ids, epic).await?;
        runner.plan(&ids).await
    })?;

    println!(
        "{} tasks in {} layers",
        schedule.task_count(),
        schedule.layers.len()
    );
    for layer in &schedule.layers {
        let ids: Vec<&str> = layer.tasks.iter().map(|t| t.as_str()).collect();
        println!("  Layer {}: {}", layer.index, ids.join(", "));
    }
    Ok(())
}

fn run_status(config: Config, wave_id: &str, json: bool) -> Result<()> {
    let status = wave_status(&config, wave_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status);
    }
    Ok(())
}

fn run_resume(config: Config, wave_id: &str, repo: Option<PathBuf>) -> Result<()> {
    let repo = repo_path(repo)?;
    rlog!("Resume command: wave={} repo={}", wave_id, repo.display());

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt.block_on(async {
        let (tx, printer) = spawn_event_printer();
        let runner = WaveRunner::from_config(config, &repo)?.with_events(tx);
        runner.resume(wave_id).await?;
        let status = runner.status(wave_id);
        drop(runner);
        let _ = printer.await;
        status
    })?;

    println!();
    print!("{}", status);
    finish(status.state)
}

fn run_cancel(config: Config, wave_id: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let state = rt.block_on(cancel_wave(&config, wave_id))?;
    match state {
        WaveState::Cancelled => println!("Wave {} cancelled; in-flight attempts will finish", wave_id),
        other => println!("Wave {} is already {}", wave_id, other),
    }
    Ok(())
}

fn run_waves(config: Config) -> Result<()> {
    let waves = list_waves(&config)?;
    if waves.is_empty() {
        println!("No waves");
        return Ok(());
    }
    for wave in waves {
        println!(
            "  {:<24} {:<10} {} tasks  {}",
            wave.wave_id,
            wave.state.to_string(),
            wave.tasks.len(),
            wave.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Exit non-zero when the wave did not complete.
fn finish(state: WaveState) -> Result<()> {
    if state == WaveState::Complete {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
