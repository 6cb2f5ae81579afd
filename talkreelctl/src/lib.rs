use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkreel_core::pipeline::{Pipeline, PipelineError, PipelineResult, RunStats};
use talkreel_core::plan::HallFilter;
use talkreel_core::{load_fetcher_config, load_resolver_config, load_talkreel_config, ConfigBundle};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] talkreel_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Conference talk batch downloader", long_about = None)]
pub struct Cli {
    /// Path to the main talkreel.toml
    #[arg(long, default_value = "configs/talkreel.toml")]
    pub config: PathBuf,
    /// Alternative path for resolver.toml
    #[arg(long)]
    pub resolver_config: Option<PathBuf>,
    /// Alternative path for fetcher.toml
    #[arg(long)]
    pub fetcher_config: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download the talks of selected halls
    Download(DownloadArgs),
    /// Re-scan the whole schedule and fetch whatever is still missing
    Retry,
    /// Remove the scratch directory with all partial downloads
    Clean,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct DownloadArgs {
    /// Hall names to include (case-insensitive substring match)
    #[arg(long, num_args = 1..)]
    pub halls: Vec<String>,
    /// Include every hall in the schedule
    #[arg(long)]
    pub all: bool,
}

impl DownloadArgs {
    pub fn filter(&self) -> HallFilter {
        if self.all {
            HallFilter::All
        } else {
            HallFilter::Halls(self.halls.clone())
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Download(args) => {
            let filter = args.filter();
            let stats = block_on_pipeline(context.pipeline.run(&filter))?;
            render(&stats, cli.format)?;
        }
        Commands::Retry => {
            let stats = block_on_pipeline(context.pipeline.retry())?;
            render(&stats, cli.format)?;
        }
        Commands::Clean => {
            let removed = block_on_pipeline(context.pipeline.clean_scratch())?;
            render(&CleanReport { removed }, cli.format)?;
        }
    }

    Ok(())
}

/// Filter follows RUST_LOG and falls back to info. `try_init` keeps repeated
/// invocations from tests harmless.
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn block_on_pipeline<F, T>(future: F) -> Result<T>
where
    F: std::future::Future<Output = PipelineResult<T>>,
{
    let outcome = if let Ok(handle) = Handle::try_current() {
        handle.block_on(future)
    } else {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(future)
    };
    Ok(outcome?)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    pipeline: Pipeline,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let talkreel = load_talkreel_config(&cli.config)?;

        let config_dir = cli
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let resolver_path = cli
            .resolver_config
            .clone()
            .unwrap_or_else(|| config_dir.join("resolver.toml"));
        let fetcher_path = cli
            .fetcher_config
            .clone()
            .unwrap_or_else(|| config_dir.join("fetcher.toml"));

        let resolver = load_resolver_config(&resolver_path)?;
        let fetcher = load_fetcher_config(&fetcher_path)?;

        Ok(Self {
            pipeline: Pipeline::new(ConfigBundle {
                talkreel,
                resolver,
                fetcher,
            }),
        })
    }
}

impl DisplayFallback for RunStats {
    fn display(&self) -> String {
        if self.planned == 0 {
            return "Nothing to download, every selected talk is already on disk".to_string();
        }
        let mut lines = vec![format!(
            "Planned: {} | Resolved: {} | Succeeded: {} | Failed: {} ({}s)",
            self.planned, self.resolved, self.succeeded, self.failed, self.duration_secs
        )];
        if !self.errors.is_empty() {
            lines.push("Failures:".to_string());
            for error in &self.errors {
                lines.push(format!("  - {error}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CleanReport {
    pub removed: Option<PathBuf>,
}

impl DisplayFallback for CleanReport {
    fn display(&self) -> String {
        match &self.removed {
            Some(path) => format!("Removed scratch directory {}", path.display()),
            None => "Scratch directory was already absent".to_string(),
        }
    }
}
