use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::services::hook_runner::{HookKind, HookRunner};
use crate::common::{MirrorError, MirrorResult, Outcome};
use crate::domain::entities::mirror_config::{MirrorConfig, MirrorOverrides, ProjectConfig};
use crate::domain::entities::repository::RepositoryDescriptor;
use crate::domain::entities::step::{ApiCall, CommandStep, Step, PROJECT_SUBST};
use crate::domain::value_objects::scm_type::ScmType;
use crate::infrastructure::http::IndexerApi;
use crate::infrastructure::process::{CommandExecutor, ProcessDescriptor};
use crate::infrastructure::scm::{RepositoryOperations, ScmError, ScmFactory};

/// 全プロジェクトで共有する読み取り専用のコンテキスト
#[derive(Clone)]
pub struct MirrorContext {
    /// 検証済みのミラー設定
    pub config: Arc<MirrorConfig>,

    /// インデックスサービス
    pub api: Arc<dyn IndexerApi>,

    /// インデックスサービスのソースルート
    pub source_root: PathBuf,

    /// コマンドラインからの上書き
    pub overrides: MirrorOverrides,

    /// 中断時に実行中のプロセスを止めるためのトークン
    pub cancellation: Option<CancellationToken>,
}

/// 1プロジェクトのミラー処理
pub struct MirrorProjectUseCase {
    context: MirrorContext,
}

impl MirrorProjectUseCase {
    pub fn new(context: MirrorContext) -> Self {
        Self { context }
    }

    /// プロジェクトをミラーし、成功・失敗・継続のいずれかを返す
    pub async fn execute(&self, project: &str) -> Outcome {
        let span = info_span!("project", name = %project);
        async {
            let config = match self.context.config.resolve(project, self.context.overrides) {
                Ok(config) => config,
                Err(e) => {
                    error!("Cannot resolve configuration of project {}: {}", project, e);
                    return Outcome::Failure;
                }
            };

            let outcome = self.mirror(&config).await;
            if outcome == Outcome::Failure && config.ignore_errors {
                warn!("Ignoring errors of project {}", project);
                return Outcome::Success;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn mirror(&self, config: &ProjectConfig) -> Outcome {
        let project = config.name.as_str();

        if config.disabled {
            self.handle_disabled(config).await;
            info!("Project '{}' disabled, exiting", project);
            return Outcome::Continue;
        }

        // Resolving the repositories first avoids a needless pre-hook run
        // when something is wrong with them.
        let repos = match self.repositories(config).await {
            Ok(repos) => repos,
            Err(e) => {
                error!("Cannot get repositories of project {}: {}", project, e);
                return Outcome::Failure;
            }
        };
        if repos.is_empty() {
            info!("No repositories for project {}", project);
            return Outcome::Continue;
        }

        if config.strip_outgoing {
            if let Err(e) = self.strip_outgoing(project, &repos).await {
                error!("Cannot strip outgoing changes of project {}: {}", project, e);
                return Outcome::Failure;
            }
        }

        if config.check_changes {
            match self.has_changes(project, &repos).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("No incoming changes for repositories in project {}", project);
                    return Outcome::Continue;
                }
                Err(e) => {
                    error!("Cannot check changes of project {}: {}", project, e);
                    return Outcome::Failure;
                }
            }
        }

        let project_dir = self.context.source_root.join(project);
        let hooks = HookRunner::new().with_cancellation(self.context.cancellation.clone());

        if let Some(pre_hook) = &config.pre_hook {
            if !hooks
                .run(HookKind::Pre, pre_hook, &project_dir, &config.env, config.hook_timeout)
                .await
            {
                error!("pre hook failed for project {}", project);
                return Outcome::Failure;
            }
        }

        // A failed repository fails the project, the others still sync.
        let mut outcome = Outcome::Success;
        for repo in &repos {
            info!("Synchronizing repository {}", repo.descriptor());
            if repo.sync().await != Outcome::SUCCESS_CODE {
                error!("failed to synchronize repository {}", repo.descriptor());
                outcome = Outcome::Failure;
            }
            if repo.top_level() {
                break;
            }
        }

        if let Some(post_hook) = &config.post_hook {
            if !hooks
                .run(HookKind::Post, post_hook, &project_dir, &config.env, config.hook_timeout)
                .await
            {
                error!("post hook failed for project {}", project);
                return Outcome::Failure;
            }
        }

        outcome
    }

    /// インデックスサービスからリポジトリ一覧を取得してドライバを作る
    ///
    /// 作成やコマンド検査に失敗したリポジトリはログに残して除外する。
    /// プロジェクトルートのリポジトリが先頭になる。
    async fn repositories(
        &self,
        config: &ProjectConfig,
    ) -> MirrorResult<Vec<Arc<dyn RepositoryOperations>>> {
        let project = config.name.as_str();
        let project_root_path = PathBuf::from(format!("/{}", project));
        let project_root = self.context.source_root.join(project);

        let mut repos: Vec<Arc<dyn RepositoryOperations>> = Vec::new();
        for repo_path in self.context.api.get_repositories(project).await? {
            debug!("Repository path = {}", repo_path);

            let relative = pathdiff::diff_paths(&repo_path, &project_root_path)
                .unwrap_or_else(|| PathBuf::from(&repo_path));
            if config.is_ignored(&relative) {
                info!("repository {} ignored", repo_path);
                continue;
            }

            let scm_name = self
                .context
                .api
                .get_repository_type(&repo_path)
                .await?
                .ok_or_else(|| {
                    MirrorError::repository_error(
                        format!("cannot determine type of repository {}", repo_path),
                        Some(repo_path.clone()),
                    )
                })?;
            debug!("Repository type = {}", scm_name);

            let scm_type: ScmType = scm_name.parse().map_err(|_| {
                MirrorError::repository_error_with_source(
                    format!("cannot mirror repository {}", repo_path),
                    Some(repo_path.clone()),
                    ScmError::unsupported_type(&scm_name),
                )
            })?;

            let descriptor = RepositoryDescriptor::new(
                scm_type,
                source_path(&self.context.source_root, &repo_path),
                project,
            )
            .with_commands(self.context.config.command_entry(scm_type).cloned())
            .with_env(config.env.clone())
            .with_timeout(config.command_timeout);
            match self.driver(descriptor).await {
                Ok(repo) => repos.push(repo),
                Err(e) => error!("Cannot get repository for {}: {}", repo_path, e),
            }
        }

        repos.sort_by_key(|repo| !repo.descriptor().is_project_root(&project_root));
        Ok(repos)
    }

    async fn driver(&self, descriptor: RepositoryDescriptor) -> MirrorResult<Arc<dyn RepositoryOperations>> {
        let repo = ScmFactory::create(descriptor, self.context.cancellation.clone())?;
        if !repo.check_command() {
            return Err(MirrorError::repository_error(
                format!("invalid {} command configuration", repo.descriptor().scm_type),
                Some(repo.descriptor().to_string()),
            ));
        }
        repo.prepare().await?;
        Ok(repo)
    }

    /// ローカルのみの変更を破棄し、破棄した場合はインデックスデータを削除する
    async fn strip_outgoing(
        &self,
        project: &str,
        repos: &[Arc<dyn RepositoryOperations>],
    ) -> MirrorResult<()> {
        let mut stripped = false;
        for repo in repos {
            if repo.strip_outgoing().await? {
                info!("Outgoing changes of repository {} were stripped", repo.descriptor());
                stripped = true;
            }
            if repo.top_level() {
                break;
            }
        }

        if stripped {
            info!("Removing index data of project {} to get it reindexed", project);
            self.context.api.delete_project_data(project).await?;
        }
        Ok(())
    }

    /// 未インデックスのプロジェクトは常に変更ありとみなす
    async fn has_changes(
        &self,
        project: &str,
        repos: &[Arc<dyn RepositoryOperations>],
    ) -> MirrorResult<bool> {
        if !self.context.api.is_project_indexed(project).await? {
            info!("Project {} has not been indexed yet", project);
            return Ok(true);
        }

        for repo in repos {
            if repo.incoming().await? {
                debug!("Repository {} has incoming changes", repo.descriptor());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 無効化されたプロジェクトに設定されたアクションを1回だけ実行する
    async fn handle_disabled(&self, config: &ProjectConfig) {
        let Some(action) = &self.context.config.disabled_command else {
            return;
        };
        debug!("Calling disabled command: {}", action);

        match action {
            Step::Call(call) => {
                let call = disabled_call(call, config.disabled_reason.as_deref());
                if let Err(e) = self.context.api.call(&call, &config.name).await {
                    error!("API call failed for disabled command of project '{}': {}", config.name, e);
                }
            }
            Step::Command(command) => {
                let process = disabled_process(command, &config.name, config.disabled_reason.as_deref())
                    .with_cancellation(self.context.cancellation.clone());
                let result = CommandExecutor::execute(&process).await;
                if !result.is_success() {
                    result.log_error(&format!("Command for disabled project '{}' failed", config.name));
                    error!("{}", result.output_string().trim_end());
                }
            }
        }
    }
}

/// Repository paths reported by the indexing service start with `/` and are
/// relative to the source root.
fn source_path(source_root: &Path, repo_path: &str) -> PathBuf {
    source_root.join(repo_path.trim_start_matches('/'))
}

/// Messages API calls get the disabled reason appended to their text.
fn disabled_call(call: &ApiCall, reason: Option<&str>) -> ApiCall {
    let mut call = call.clone();
    let Some(reason) = reason else {
        return call;
    };
    if !call.targets_indexer_api() {
        return call;
    }
    if let Some(serde_json::Value::Object(data)) = call.data.as_mut() {
        if let Some(serde_json::Value::String(text)) = data.get_mut("text") {
            debug!("Appending text to message: {}", reason);
            text.push_str(": ");
            text.push_str(reason);
        }
    }
    call
}

fn disabled_process(command: &CommandStep, project: &str, reason: Option<&str>) -> ProcessDescriptor {
    let mut append = vec![project.to_string()];
    if let Some(reason) = reason {
        append.push(reason.to_string());
    }
    ProcessDescriptor::new(command.args.clone())
        .with_env(&command.env)
        .with_resource_limits(&command.limits)
        .with_timeout(command.timeout_duration())
        .with_substitution(PROJECT_SUBST, project)
        .with_append(append, true)
}
