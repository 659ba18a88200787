use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::use_cases::mirror_project::MirrorContext;
use crate::application::use_cases::mirror_projects::MirrorProjectsUseCase;
use crate::common::{MirrorError, Outcome};
use crate::domain::entities::mirror_config::{MirrorConfig, MirrorOverrides};
use crate::infrastructure::filesystem::ConfigStore;
use crate::infrastructure::http::{IndexerApi, IndexerClient};
use crate::presentation::cli::{logging, MirrorArgs};

/// Non-empty value skips mirroring altogether
pub const NO_MIRROR_ENV: &str = "NO_MIRROR";

/// Handler for the mirror command
pub struct MirrorCommand {
    pub args: MirrorArgs,
    pub verbose: bool,
}

impl MirrorCommand {
    pub fn new(args: MirrorArgs, verbose: bool) -> Self {
        Self { args, verbose }
    }

    pub async fn execute(&self, cancellation: CancellationToken) -> Result<Outcome> {
        if std::env::var(NO_MIRROR_ENV).map(|v| !v.is_empty()).unwrap_or(false) {
            return Ok(Outcome::Success);
        }

        if self.args.all && !self.args.projects.is_empty() {
            anyhow::bail!("Cannot use both project list and -a/--all");
        }
        if !self.args.all && self.args.projects.is_empty() {
            anyhow::bail!("Need at least one project or --all");
        }
        self.args.api.check_uri()?;

        let config: MirrorConfig = match &self.args.config {
            Some(path) => ConfigStore::new()
                .read_config(path)
                .with_context(|| format!("Cannot read config file from {}", path.display()))?,
            None => MirrorConfig::default(),
        };

        let log_file = match self.batch_logdir(&config)? {
            Some(logdir) => Some(logging::batch_log_file(&logdir, "mirror")?),
            None => None,
        };
        logging::init(self.verbose, log_file.as_deref())?;
        debug!("web application URI = {}", self.args.api.uri);

        config.check()?;

        let indexer = self.args.api.indexer()?;
        let source_root = indexer.get_config_value(IndexerClient::SOURCE_ROOT).await?;
        if source_root.is_empty() {
            anyhow::bail!("Cannot get source root from {}", self.args.api.uri);
        }
        debug!("Source root = {}", source_root);

        let context = MirrorContext {
            config: Arc::new(config),
            api: Arc::new(indexer),
            source_root: PathBuf::from(source_root),
            overrides: MirrorOverrides {
                check_changes: self.args.check_changes,
                strip_outgoing: self.args.strip_outgoing,
            },
            cancellation: Some(cancellation),
        };

        let mut use_case = MirrorProjectsUseCase::new(context.clone());
        if let Some(workers) = self.args.workers {
            use_case = use_case.with_workers(workers);
        }

        let projects = if self.args.all {
            use_case.indexed_projects().await?
        } else {
            for project in &self.args.projects {
                if !context.api.has_project(project).await? {
                    anyhow::bail!("Project {} is not known to the indexing service", project);
                }
            }
            self.args.projects.clone()
        };

        let multiple = self.args.all || projects.len() != 1;
        let outcome = match use_case.execute(&projects, multiple).await {
            Ok(outcome) => outcome,
            Err(MirrorError::LockContention { key }) => {
                warn!("Already running ({} is locked), exiting.", key);
                return Ok(Outcome::Failure);
            }
            Err(e) => return Err(e.into()),
        };

        if !self.args.batch {
            print_outcome(outcome);
        }
        Ok(outcome)
    }

    fn batch_logdir(&self, config: &MirrorConfig) -> Result<Option<PathBuf>> {
        if !self.args.batch {
            return Ok(None);
        }
        match self.args.logdir.clone().or_else(|| config.logdir.clone()) {
            Some(logdir) => Ok(Some(logdir)),
            None => anyhow::bail!("The logdir property is required in batch mode"),
        }
    }
}

fn print_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Success => println!("{} Mirroring completed", "✓".green().bold()),
        Outcome::Continue => println!("{} Nothing to mirror", "::".blue().bold()),
        Outcome::Failure => println!("{} Mirroring failed", "✗".red().bold()),
    }
}
