use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::use_cases::command_sequence::CommandSequence;
use crate::common::{MirrorError, MirrorResult, Outcome};
use crate::domain::entities::step::SyncConfig;
use crate::infrastructure::filesystem::LockSet;
use crate::infrastructure::http::IndexerApi;

/// ステップシーケンス実行のロックキー
pub const SYNC_LOCK_KEY: &str = "sync";

/// 処理するプロジェクトの選び方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectSelection {
    /// 明示的に与えられたプロジェクト
    Explicit(Vec<String>),
    /// インデックス済みのプロジェクト
    Indexed,
    /// ディレクトリ直下のサブディレクトリ
    Directory(PathBuf),
}

/// 複数プロジェクトに対してステップシーケンスを並列に実行する
pub struct SyncProjectsUseCase {
    config: SyncConfig,
    api: Arc<dyn IndexerApi>,
    base_url: String,
    workers: usize,
    driveon: bool,
    ignore_errors: Vec<String>,
    lock_dir: Option<PathBuf>,
    cancellation: Option<CancellationToken>,
}

impl SyncProjectsUseCase {
    pub fn new(config: SyncConfig, api: Arc<dyn IndexerApi>, base_url: impl Into<String>) -> Self {
        let ignore_errors = config.ignore_errors.clone();
        Self {
            config,
            api,
            base_url: base_url.into(),
            workers: num_cpus::get(),
            driveon: false,
            ignore_errors,
            lock_dir: Some(std::env::temp_dir()),
            cancellation: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_driveon(mut self, driveon: bool) -> Self {
        self.driveon = driveon;
        self
    }

    /// コマンドラインで与えられた場合は設定ファイルの一覧より優先する
    pub fn with_ignore_errors(mut self, ignore_errors: Option<Vec<String>>) -> Self {
        if let Some(ignore_errors) = ignore_errors {
            self.ignore_errors = ignore_errors;
        }
        self
    }

    /// `None` でロックを取らない
    pub fn with_lock_dir(mut self, lock_dir: Option<PathBuf>) -> Self {
        self.lock_dir = lock_dir;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Option<CancellationToken>) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 選択方法に従ってプロジェクト一覧を得る
    pub async fn projects(&self, selection: &ProjectSelection) -> MirrorResult<Vec<String>> {
        let projects = match selection {
            ProjectSelection::Explicit(projects) => projects.clone(),
            ProjectSelection::Indexed => {
                let projects = self.api.list_indexed_projects().await?;
                if projects.is_empty() {
                    return Err(MirrorError::protocol_error(
                        "cannot get list of projects",
                        Some(self.base_url.clone()),
                    ));
                }
                projects.iter().map(|p| p.trim().to_string()).collect()
            }
            ProjectSelection::Directory(dir) => {
                debug!("Processing directory {}", dir.display());
                list_directories(dir)?
            }
        };
        debug!("to process: {:?}", projects);
        Ok(projects)
    }

    /// ロックを取得して選択されたプロジェクトを処理する
    pub async fn execute(&self, selection: &ProjectSelection) -> MirrorResult<Outcome> {
        let _lock = match &self.lock_dir {
            Some(dir) => Some(LockSet::try_acquire(dir, [SYNC_LOCK_KEY])?),
            None => None,
        };

        let projects = self.projects(selection).await?;
        Ok(self.run(&projects).await)
    }

    /// 全プロジェクトのシーケンスを実行し、1つでも失敗があれば失敗
    pub async fn run(&self, projects: &[String]) -> Outcome {
        if projects.is_empty() {
            info!("No projects to process");
            return Outcome::Success;
        }

        let semaphore = Arc::new(Semaphore::new(std::cmp::min(projects.len(), self.workers)));
        let mut tasks: Vec<_> = projects
            .iter()
            .map(|project| {
                let sequence = CommandSequence::new(project.clone(), self.config.commands.clone(), self.api.clone())
                    .with_cleanup(self.config.cleanup.clone())
                    .with_driveon(self.driveon)
                    .with_base_url(self.base_url.clone())
                    .with_cancellation(self.cancellation.clone());
                let semaphore = semaphore.clone();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    Some(sequence.run().await)
                })
            })
            .collect();

        let results = {
            let joined = join_all(tasks.iter_mut());
            match &self.cancellation {
                Some(token) => tokio::select! {
                    results = joined => Some(results),
                    _ = token.cancelled() => None,
                },
                None => Some(joined.await),
            }
        };

        let Some(results) = results else {
            warn!("Interrupted, abandoning {} project(s)", tasks.len());
            for task in &tasks {
                task.abort();
            }
            return Outcome::Failure;
        };

        let mut outcome = Outcome::Success;
        for (result, project) in results.into_iter().zip(projects) {
            match result {
                Ok(Some(report)) => {
                    debug!("Checking results of project {}", project);
                    if report.check(&self.ignore_errors) != Outcome::Success {
                        outcome = Outcome::Failure;
                    }
                }
                Ok(None) => {
                    error!("Worker pool closed before project {} could run", project);
                    outcome = Outcome::Failure;
                }
                Err(e) => {
                    error!("Processing of project {} did not complete: {}", project, e);
                    outcome = Outcome::Failure;
                }
            }
        }
        outcome
    }
}

/// ディレクトリ直下のサブディレクトリ名（ソート済み）
pub fn list_directories(dir: &Path) -> MirrorResult<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        MirrorError::filesystem_error_with_source("Cannot read directory", Some(dir.to_path_buf()), e)
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
