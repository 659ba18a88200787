pub mod commands;
pub mod logging;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::common::Outcome;
use crate::infrastructure::http::{parse_header, IndexerClient, RestClient};

/// Default location of the indexing web application
pub const DEFAULT_URI: &str = "http://localhost:8080/source";

/// repomirror - mirror repositories of indexed projects
#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "Mirror source repositories of indexed projects")]
#[command(version)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), " for ", env!("BUILD_TARGET"), ")"
))]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize the repositories of projects
    Mirror(MirrorArgs),

    /// Run a configured step sequence for each project
    Sync(SyncArgs),
}

/// Connection to the indexing service
#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    /// URI of the web application with context path
    #[arg(short = 'U', long, default_value = DEFAULT_URI)]
    pub uri: String,

    /// HTTP header to send with every API request, in `Name: value` form
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Timeout of API requests in seconds
    #[arg(long)]
    pub api_timeout: Option<u64>,

    /// Timeout for asynchronous API requests to complete, in seconds
    #[arg(long)]
    pub async_api_timeout: Option<u64>,
}

impl ApiArgs {
    /// Only http(s) URLs are accepted.
    pub fn check_uri(&self) -> anyhow::Result<()> {
        match url::Url::parse(&self.uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            _ => anyhow::bail!("Not a URI: {}", self.uri),
        }
    }

    pub fn indexer(&self) -> anyhow::Result<IndexerClient> {
        let headers = self
            .headers
            .iter()
            .map(|header| parse_header(header))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let rest = RestClient::new()?
            .with_headers(headers)
            .with_api_timeout(self.api_timeout.map(Duration::from_secs))
            .with_async_api_timeout(self.async_api_timeout.map(Duration::from_secs));
        Ok(IndexerClient::new(rest, &self.uri)?)
    }
}

#[derive(Args, Debug, Clone)]
pub struct MirrorArgs {
    /// Projects to mirror
    pub projects: Vec<String>,

    /// Mirror all indexed projects
    #[arg(short, long)]
    pub all: bool,

    /// Configuration file in YAML or JSON format
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Batch mode, log into a file in the log directory
    #[arg(short, long)]
    pub batch: bool,

    /// Log directory for batch mode (overrides `logdir` of the configuration)
    #[arg(short = 'L', long)]
    pub logdir: Option<PathBuf>,

    /// Stop processing of a project when none of its repositories has incoming changes
    #[arg(short = 'I', long)]
    pub check_changes: bool,

    /// Discard local-only changes before synchronizing
    #[arg(long)]
    pub strip_outgoing: bool,

    /// Number of projects processed in parallel
    #[arg(short, long)]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Configuration file with the step sequence
    #[arg(short, long)]
    pub config: PathBuf,

    /// Process the sub-directories of this directory
    #[arg(short, long, conflicts_with = "projects")]
    pub directory: Option<PathBuf>,

    /// Projects to process
    #[arg(short = 'P', long, num_args = 1..)]
    pub projects: Vec<String>,

    /// Process indexed projects only
    #[arg(short = 'I', long)]
    pub indexed: bool,

    /// Ignore errors of these projects (overrides `ignore_errors` of the configuration)
    #[arg(short = 'i', long = "ignore-errors", num_args = 0..)]
    pub ignore_errors: Option<Vec<String>>,

    /// Keep processing the sequence when a step asks to stop
    #[arg(short = 'f', long)]
    pub driveon: bool,

    /// Do not take the lock preventing concurrent runs
    #[arg(long)]
    pub nolock: bool,

    /// Number of projects processed in parallel
    #[arg(short, long)]
    pub workers: Option<usize>,

    #[command(flatten)]
    pub api: ApiArgs,
}

/// CLI application runner
pub struct CliApp {
    cli: Cli,
}

impl Default for CliApp {
    fn default() -> Self {
        Self::new()
    }
}

impl CliApp {
    pub fn new() -> Self {
        Self { cli: Cli::parse() }
    }

    pub fn from_cli(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the selected command; the exit code is the aggregate outcome.
    pub async fn run(self) -> ExitCode {
        if self.cli.no_color {
            colored::control::set_override(false);
        }

        // Ctrl-C stops the running child processes and ends the run.
        let cancellation = CancellationToken::new();
        let interrupt = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted");
                interrupt.cancel();
            }
        });

        match self.handle_command(cancellation).await {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
                Outcome::Failure.into()
            }
        }
    }

    async fn handle_command(&self, cancellation: CancellationToken) -> anyhow::Result<Outcome> {
        match &self.cli.command {
            Commands::Mirror(args) => {
                commands::MirrorCommand::new(args.clone(), self.cli.verbose)
                    .execute(cancellation)
                    .await
            }
            Commands::Sync(args) => {
                commands::SyncCommand::new(args.clone(), self.cli.verbose)
                    .execute(cancellation)
                    .await
            }
        }
    }
}
