use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::use_cases::sync_projects::{ProjectSelection, SyncProjectsUseCase};
use crate::common::{MirrorError, Outcome};
use crate::domain::entities::step::SyncConfig;
use crate::infrastructure::filesystem::ConfigStore;
use crate::infrastructure::http::{IndexerApi, IndexerClient};
use crate::presentation::cli::{logging, SyncArgs};

/// Handler for the sync command
pub struct SyncCommand {
    pub args: SyncArgs,
    pub verbose: bool,
}

impl SyncCommand {
    pub fn new(args: SyncArgs, verbose: bool) -> Self {
        Self { args, verbose }
    }

    pub async fn execute(&self, cancellation: CancellationToken) -> Result<Outcome> {
        logging::init(self.verbose, None)?;
        self.args.api.check_uri()?;
        debug!("web application URI = {}", self.args.api.uri);

        let config: SyncConfig = ConfigStore::new()
            .read_config(&self.args.config)
            .with_context(|| format!("Cannot read config file from {}", self.args.config.display()))?;
        config.check()?;

        let indexer = self.args.api.indexer()?;
        let selection = self.selection(&indexer).await?;
        let base_url = indexer
            .rest()
            .base_url()
            .map(str::to_string)
            .unwrap_or_else(|| self.args.api.uri.clone());

        let mut use_case = SyncProjectsUseCase::new(config, Arc::new(indexer), base_url)
            .with_driveon(self.args.driveon)
            .with_ignore_errors(self.args.ignore_errors.clone())
            .with_cancellation(Some(cancellation));
        if self.args.nolock {
            use_case = use_case.with_lock_dir(None);
        }
        if let Some(workers) = self.args.workers {
            use_case = use_case.with_workers(workers);
        }

        let outcome = match use_case.execute(&selection).await {
            Ok(outcome) => outcome,
            Err(MirrorError::LockContention { .. }) => {
                warn!("Already running");
                return Ok(Outcome::Failure);
            }
            Err(e) => return Err(e.into()),
        };

        match outcome {
            Outcome::Failure => println!("{} Some projects failed", "✗".red().bold()),
            _ => println!("{} All projects processed", "✓".green().bold()),
        }
        Ok(outcome)
    }

    async fn selection(&self, indexer: &IndexerClient) -> Result<ProjectSelection> {
        if !self.args.projects.is_empty() {
            return Ok(ProjectSelection::Explicit(self.args.projects.clone()));
        }
        if self.args.indexed {
            return Ok(ProjectSelection::Indexed);
        }
        if let Some(directory) = &self.args.directory {
            return Ok(ProjectSelection::Directory(directory.clone()));
        }

        let source_root = indexer
            .get_config_value(IndexerClient::SOURCE_ROOT)
            .await
            .context("Neither -d, -P nor -I specified and cannot get source root from the web application")?;
        info!("Assuming directory: {}", source_root);
        Ok(ProjectSelection::Directory(PathBuf::from(source_root)))
    }
}
