use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

/// Git implementation of repository operations
pub struct GitScm {
    base: ScmBase,
}

impl GitScm {
    /// Create a new Git driver for the working copy
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        Ok(Self {
            base: ScmBase::new(descriptor, cancellation)?,
        })
    }

    /// Execute a git command and check for success
    async fn execute_git_command_checked(&self, args: &[&str]) -> Result<String, ScmError> {
        let result = self.base.run_checked(self.base.command_args(args)).await?;
        Ok(result.output_string().trim().to_string())
    }

    async fn current_branch(&self) -> Result<String, ScmError> {
        let branch = self
            .execute_git_command_checked(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if branch.is_empty() {
            return Err(ScmError::indeterminate(
                self.base.descriptor().to_string(),
                "cannot determine current branch",
            ));
        }
        Ok(branch)
    }

    /// Commit hashes of `range`, oldest first
    async fn commits(&self, range: &str) -> Result<Vec<String>, ScmError> {
        let output = self
            .execute_git_command_checked(&["log", "--pretty=tformat:%H", "--reverse", range])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl RepositoryOperations for GitScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    /// Pulls must never create merge commits in a mirror.
    async fn prepare(&self) -> Result<(), ScmError> {
        self.execute_git_command_checked(&["config", "--local", "pull.ff", "only"])
            .await
            .map(|_| ())
    }

    async fn repo_sync(&self) -> i32 {
        let process = self.base.process(self.base.command_args(&["pull", "--ff-only"]));
        let result = self.base.execute(&process).await;
        self.base.log_sync_output(&result);
        if result.is_success() {
            0
        } else {
            result.log_error("failed to perform pull");
            1
        }
    }

    async fn incoming_check(&self) -> Result<bool, ScmError> {
        let branch = self.current_branch().await?;
        self.execute_git_command_checked(&["fetch"]).await?;

        let incoming = self.commits(&format!("{}..origin/{}", branch, branch)).await?;
        debug!("{} incoming commits in {}", incoming.len(), self.base.descriptor());
        Ok(!incoming.is_empty())
    }

    async fn strip_outgoing(&self) -> Result<bool, ScmError> {
        let branch = self.current_branch().await?;
        let outgoing = self.commits(&format!("origin/{}..{}", branch, branch)).await?;

        let Some(oldest) = outgoing.first() else {
            return Ok(false);
        };
        debug!(
            "Resetting the repository {} to parent of changeset '{}'",
            self.base.descriptor(),
            oldest
        );
        self.execute_git_command_checked(&["reset", "--hard", &format!("{}^", oldest)])
            .await?;
        Ok(true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::entities::repository::CommandEntry;
    use crate::domain::value_objects::scm_type::ScmType;
    use crate::infrastructure::scm::scm_interface::test_support::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tempfile::TempDir;

    /// Fake git answering the subcommands the driver uses
    fn fake_git(dir: &Path, incoming: &str, outgoing: &str) -> GitScm {
        let body = format!(
            r#"case "$1" in
  rev-parse) echo main ;;
  log)
    case "$4" in
      main..origin/main) printf '{incoming}' ;;
      origin/main..main) printf '{outgoing}' ;;
    esac ;;
  pull) echo "Already up to date." ;;
esac
exit 0"#
        );
        let git = recording_script(dir, "git", &body);
        let descriptor = RepositoryDescriptor::new(ScmType::Git, dir, "foo")
            .with_commands(Some(CommandEntry::Path(git.display().to_string())));
        GitScm::new(descriptor, None).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_configures_fast_forward_pull() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "", "");

        git.prepare().await.unwrap();
        assert_eq!(recorded_calls(temp_dir.path()), vec!["config --local pull.ff only"]);
    }

    #[tokio::test]
    async fn test_incoming_without_changes() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "", "");

        assert!(!git.incoming().await.unwrap());
        assert_eq!(
            recorded_calls(temp_dir.path()),
            vec![
                "rev-parse --abbrev-ref HEAD",
                "fetch",
                "log --pretty=tformat:%H --reverse main..origin/main",
            ]
        );
    }

    #[tokio::test]
    async fn test_incoming_with_changes() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "abc\\n", "");
        assert!(git.incoming().await.unwrap());
    }

    #[tokio::test]
    async fn test_strip_outgoing_resets_to_parent_of_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "", "c1\\nc2\\n");

        assert!(git.strip_outgoing().await.unwrap());
        let calls = recorded_calls(temp_dir.path());
        assert_eq!(calls.last().map(String::as_str), Some("reset --hard c1^"));
    }

    #[tokio::test]
    async fn test_strip_outgoing_without_changes() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "", "");

        assert!(!git.strip_outgoing().await.unwrap());
        assert!(!recorded_calls(temp_dir.path()).iter().any(|c| c.starts_with("reset")));
    }

    #[tokio::test]
    async fn test_sync_pulls_fast_forward_only() {
        let temp_dir = TempDir::new().unwrap();
        let git = fake_git(temp_dir.path(), "", "");

        assert_eq!(git.sync().await, 0);
        assert_eq!(recorded_calls(temp_dir.path()), vec!["pull --ff-only"]);
    }

    #[tokio::test]
    async fn test_failing_fetch_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let git = write_script(
            temp_dir.path(),
            "git",
            "case \"$1\" in rev-parse) echo main ;; fetch) exit 128 ;; esac",
        );
        let descriptor = RepositoryDescriptor::new(ScmType::Git, temp_dir.path(), "foo")
            .with_commands(Some(CommandEntry::Path(git.display().to_string())));
        let git = GitScm::new(descriptor, None).unwrap();

        assert!(matches!(git.incoming().await, Err(ScmError::CommandFailed { .. })));
        assert_eq!(git.sync().await, 0);
    }

    fn git_with_script(dir: &Path, body: &str) -> GitScm {
        let git = recording_script(dir, "git", body);
        let descriptor = RepositoryDescriptor::new(ScmType::Git, dir, "foo")
            .with_commands(Some(CommandEntry::Path(git.display().to_string())));
        GitScm::new(descriptor, None).unwrap()
    }

    #[tokio::test]
    async fn test_failing_outgoing_log_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let git = git_with_script(
            temp_dir.path(),
            "case \"$1\" in rev-parse) echo main ;; log) echo 'unknown revision' >&2; exit 128 ;; esac",
        );

        assert!(matches!(git.strip_outgoing().await, Err(ScmError::CommandFailed { .. })));
        assert!(!recorded_calls(temp_dir.path()).iter().any(|c| c.starts_with("reset")));
    }

    #[tokio::test]
    async fn test_failing_reset_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let git = git_with_script(
            temp_dir.path(),
            "case \"$1\" in rev-parse) echo main ;; log) echo c1 ;; reset) exit 1 ;; esac",
        );

        assert!(matches!(git.strip_outgoing().await, Err(ScmError::CommandFailed { .. })));
    }

    #[tokio::test]
    async fn test_failing_incoming_log_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let git = git_with_script(
            temp_dir.path(),
            "case \"$1\" in rev-parse) echo main ;; log) exit 128 ;; esac",
        );

        assert!(matches!(git.incoming().await, Err(ScmError::CommandFailed { .. })));
    }
}
