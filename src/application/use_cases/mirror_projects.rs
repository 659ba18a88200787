use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::application::use_cases::mirror_project::{MirrorContext, MirrorProjectUseCase};
use crate::common::{MirrorResult, Outcome};
use crate::infrastructure::filesystem::LockSet;

/// バッチ実行全体を表すロックのキー
pub const BATCH_LOCK_KEY: &str = "mirror-batch";

/// 複数プロジェクトのミラー処理（ワーカープールで並列実行）
pub struct MirrorProjectsUseCase {
    context: MirrorContext,
    workers: usize,
    lock_dir: PathBuf,
}

impl MirrorProjectsUseCase {
    pub fn new(context: MirrorContext) -> Self {
        Self {
            context,
            workers: num_cpus::get(),
            lock_dir: std::env::temp_dir(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    /// インデックス済みの全プロジェクト
    pub async fn indexed_projects(&self) -> MirrorResult<Vec<String>> {
        let projects = self.context.api.list_indexed_projects().await?;
        debug!("Indexed projects: {:?}", projects);
        Ok(projects)
    }

    /// 実行対象に対応するロックキー
    ///
    /// プロジェクトごとのキーで重なりを検出し、バッチ実行はさらに
    /// 共通のキーを取る。
    pub fn lock_keys(projects: &[String], batch: bool) -> Vec<String> {
        let mut keys: Vec<String> = projects
            .iter()
            .map(|project| format!("{}-mirror", project))
            .collect();
        if batch {
            keys.push(BATCH_LOCK_KEY.to_string());
        }
        keys
    }

    /// ロックを取得してから全プロジェクトを並列にミラーする
    ///
    /// ロックが取得できない場合は何もせずに `LockContention` を返す。
    pub async fn execute(&self, projects: &[String], batch: bool) -> MirrorResult<Outcome> {
        let locks = LockSet::try_acquire(&self.lock_dir, Self::lock_keys(projects, batch))?;
        debug!("Acquired locks: {:?}", locks.keys());

        if projects.is_empty() {
            info!("No projects to mirror");
            return Ok(Outcome::Success);
        }

        let workers = std::cmp::min(projects.len(), self.workers);
        info!("Mirroring {} project(s) with {} worker(s)", projects.len(), workers);
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut tasks: Vec<_> = projects
            .iter()
            .map(|project| {
                let project = project.clone();
                let context = self.context.clone();
                let semaphore = semaphore.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        error!("Worker pool closed before project {} could run", project);
                        return Outcome::Failure;
                    };
                    MirrorProjectUseCase::new(context).execute(&project).await
                })
            })
            .collect();

        let results = {
            let joined = join_all(tasks.iter_mut());
            match &self.context.cancellation {
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
            return Ok(Outcome::Failure);
        };

        let outcomes: Vec<Outcome> = results
            .into_iter()
            .zip(projects)
            .map(|(result, project)| match result {
                Ok(outcome) => {
                    debug!("Project {} finished with {:?}", project, outcome);
                    outcome
                }
                Err(e) => {
                    error!("Mirroring of project {} did not complete: {}", project, e);
                    Outcome::Failure
                }
            })
            .collect();

        drop(locks);
        Ok(Outcome::aggregate(outcomes))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::common::MirrorError;
    use crate::domain::entities::mirror_config::{MirrorConfig, MirrorOverrides};
    use crate::infrastructure::filesystem::AdvisoryLock;
    use crate::infrastructure::http::indexer_api::MockIndexerApi;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(config: MirrorConfig, api: MockIndexerApi, source_root: &std::path::Path) -> MirrorContext {
        MirrorContext {
            config: Arc::new(config),
            api: Arc::new(api),
            source_root: source_root.to_path_buf(),
            overrides: MirrorOverrides::default(),
            cancellation: None,
        }
    }

    fn projects(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(
            MirrorProjectsUseCase::lock_keys(&projects(&["foo"]), false),
            vec!["foo-mirror"]
        );
        assert_eq!(
            MirrorProjectsUseCase::lock_keys(&projects(&["foo", "bar"]), true),
            vec!["foo-mirror", "bar-mirror", BATCH_LOCK_KEY]
        );
    }

    #[tokio::test]
    async fn test_aggregate_of_disabled_and_empty_projects_is_continue() {
        let temp_dir = TempDir::new().unwrap();
        let config: MirrorConfig =
            serde_yaml::from_str("projects:\n  off:\n    disabled: true\n").unwrap();
        let mut api = MockIndexerApi::new();
        api.expect_get_repositories()
            .withf(|project| project == "empty")
            .returning(|_| Ok(Vec::new()));

        let use_case = MirrorProjectsUseCase::new(context(config, api, temp_dir.path()))
            .with_workers(2)
            .with_lock_dir(temp_dir.path());
        let outcome = use_case.execute(&projects(&["off", "empty"]), false).await.unwrap();
        assert_eq!(outcome, Outcome::Continue);
    }

    #[tokio::test]
    async fn test_one_failing_project_fails_the_batch_but_not_its_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join("cvs");
        fs::write(&tool, "#!/bin/sh\necho \"$(pwd)\" >> $0.log\ncase \"$(pwd)\" in */bad) exit 1 ;; esac\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        for project in ["good", "bad"] {
            fs::create_dir(temp_dir.path().join(project)).unwrap();
        }

        let config: MirrorConfig =
            serde_yaml::from_str(&format!("commands:\n  cvs: {}\n", tool.display())).unwrap();
        let mut api = MockIndexerApi::new();
        api.expect_get_repositories()
            .returning(|project| Ok(vec![format!("/{}", project)]));
        api.expect_get_repository_type()
            .returning(|_| Ok(Some("cvs".to_string())));

        let use_case = MirrorProjectsUseCase::new(context(config, api, temp_dir.path()))
            .with_lock_dir(temp_dir.path());
        let outcome = use_case.execute(&projects(&["good", "bad"]), true).await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        let log = fs::read_to_string(temp_dir.path().join("cvs.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected_without_side_effects() {
        let temp_dir = TempDir::new().unwrap();
        let _held = AdvisoryLock::try_acquire(temp_dir.path(), "foo-mirror").unwrap();

        let mut api = MockIndexerApi::new();
        api.expect_get_repositories().never();

        let use_case = MirrorProjectsUseCase::new(context(MirrorConfig::default(), api, temp_dir.path()))
            .with_lock_dir(temp_dir.path());
        let result = use_case.execute(&projects(&["bar", "foo"]), true).await;
        assert!(matches!(result, Err(MirrorError::LockContention { .. })));

        // keys taken before the conflicting one are released again
        assert!(AdvisoryLock::try_acquire(temp_dir.path(), "bar-mirror").is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_batch_fails() {
        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join("cvs");
        fs::write(&tool, "#!/bin/sh\nsleep 30\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(temp_dir.path().join("slow")).unwrap();

        let config: MirrorConfig =
            serde_yaml::from_str(&format!("commands:\n  cvs: {}\n", tool.display())).unwrap();
        let mut api = MockIndexerApi::new();
        api.expect_get_repositories()
            .returning(|_| Ok(vec!["/slow".to_string()]));
        api.expect_get_repository_type()
            .returning(|_| Ok(Some("cvs".to_string())));

        let token = CancellationToken::new();
        let mut context = context(config, api, temp_dir.path());
        context.cancellation = Some(token.clone());
        let use_case = MirrorProjectsUseCase::new(context).with_lock_dir(temp_dir.path());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = use_case.execute(&projects(&["slow"]), false).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_indexed_projects() {
        let temp_dir = TempDir::new().unwrap();
        let mut api = MockIndexerApi::new();
        api.expect_list_indexed_projects()
            .returning(|| Ok(vec!["foo".to_string(), "bar".to_string()]));

        let use_case = MirrorProjectsUseCase::new(context(MirrorConfig::default(), api, temp_dir.path()));
        assert_eq!(use_case.indexed_projects().await.unwrap(), projects(&["foo", "bar"]));
    }
}
