use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::infrastructure::process::{CommandExecutor, ProcessDescriptor};

/// フックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Pre => write!(f, "pre"),
            HookKind::Post => write!(f, "post"),
        }
    }
}

/// 同期の前後に外部のフックを実行するサービス
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    cancellation: Option<CancellationToken>,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancellation: Option<CancellationToken>) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// フックをプロジェクトのソースディレクトリで実行する
    ///
    /// 終了コード0の場合のみ成功とみなす。
    pub async fn run(
        &self,
        kind: HookKind,
        hook: &Path,
        project_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> bool {
        info!("Running {} hook", kind);
        debug!("Running hook '{}' in directory {}", hook.display(), project_dir.display());

        let process = ProcessDescriptor::new([hook.display().to_string()])
            .with_working_directory(project_dir)
            .with_env(env)
            .with_timeout(timeout)
            .with_log_output(true)
            .with_cancellation(self.cancellation.clone());
        let result = CommandExecutor::execute(&process).await;

        if !result.is_success() {
            result.log_error(&format!("{} hook failed", kind));
            if !result.stderr.is_empty() {
                error!("{}", result.error_output_string().trim_end());
            }
            return false;
        }
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn hook(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("hook.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_hook_runs_in_project_directory_with_env() {
        let hooks = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let script = hook(hooks.path(), "echo \"$http_proxy\" > hook.out");
        let env = HashMap::from([("http_proxy".to_string(), "http://proxy:3128".to_string())]);

        assert!(HookRunner::new().run(HookKind::Pre, &script, project.path(), &env, None).await);
        let written = fs::read_to_string(project.path().join("hook.out")).unwrap();
        assert_eq!(written.trim(), "http://proxy:3128");
    }

    #[tokio::test]
    async fn test_failing_hook() {
        let hooks = TempDir::new().unwrap();
        let script = hook(hooks.path(), "exit 1");
        assert!(
            !HookRunner::new()
                .run(HookKind::Post, &script, hooks.path(), &HashMap::new(), None)
                .await
        );
    }

    #[tokio::test]
    async fn test_hook_timeout_is_a_failure() {
        let hooks = TempDir::new().unwrap();
        let script = hook(hooks.path(), "sleep 10");
        assert!(
            !HookRunner::new()
                .run(
                    HookKind::Pre,
                    &script,
                    hooks.path(),
                    &HashMap::new(),
                    Some(Duration::from_millis(200))
                )
                .await
        );
    }

    #[test]
    fn test_hook_kind_display() {
        assert_eq!(HookKind::Pre.to_string(), "pre");
        assert_eq!(HookKind::Post.to_string(), "post");
    }
}
