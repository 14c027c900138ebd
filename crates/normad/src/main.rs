//! `norma` - PDCA software-change orchestrator CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use normad::prune::{self, RetentionPolicy};
use normad::{lifecycle, AppResult, FileTaskTracker, Storage};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "norma", about = "PDCA software-change orchestrator")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the PDCA cycle for a task to a terminal status.
    Run { task_id: String },
    /// Delete runs not covered by a keep-last/keep-days retention policy.
    PruneRuns {
        #[arg(long, default_value_t = 0)]
        keep_last: u32,
        #[arg(long, default_value_t = 0)]
        keep_days: u32,
        #[arg(long)]
        dry_run: bool,
    },
    /// Global reset: remove every worktree, branch, and run under `.norma/`.
    Prune,
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match runtime.block_on(run_cli()) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli() -> AppResult<ExitCode> {
    let cli = Cli::parse();
    let repo_root = cli
        .repo_root
        .map_or_else(std::env::current_dir, Ok)?
        .canonicalize()?;

    let mut config = norma_core::Config {
        repo_root: repo_root.clone(),
        ..norma_core::Config::default()
    };
    config.resolve_paths();
    let config_path = config.norma_dir.join("config");
    if config_path.exists() {
        config.load_file(&config_path)?;
        config.resolve_paths();
    }

    let storage = Storage::new(&config.norma_dir.join("norma.db")).await?;
    storage.migrate_embedded().await?;
    let tracker = FileTaskTracker::new(config.norma_dir.join("tasks"));

    match cli.command {
        Command::Run { task_id } => {
            let result = lifecycle::run(
                &repo_root,
                &config.norma_dir,
                &config,
                &storage,
                &tracker,
                &task_id,
            )
            .await?;
            println!(
                "run {} finished: status={:?} verdict={:?}",
                result.run_id, result.status, result.verdict
            );
            Ok(if result.status == norma_core::RunStatus::Passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::PruneRuns { keep_last, keep_days, dry_run } => {
            let result = prune::prune_runs(&storage, RetentionPolicy { keep_last, keep_days }, dry_run)
                .await?;
            println!("{result:?}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune => {
            prune::prune_all(&repo_root, &config.norma_dir, &storage).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
