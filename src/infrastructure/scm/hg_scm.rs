use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

const DEFAULT_BRANCH: &str = "default";

/// Mercurial implementation of repository operations
pub struct HgScm {
    base: ScmBase,
}

impl HgScm {
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        Ok(Self {
            base: ScmBase::new(descriptor, cancellation)?,
        })
    }

    /// Name of the current branch, `None` (logged) when it cannot be read
    async fn branch(&self) -> Option<String> {
        let process = self.base.process(self.base.command_args(&["branch"]));
        let result = self.base.execute(&process).await;
        if !result.is_success() {
            result.log_error("failed to get branch");
            return None;
        }
        match result.stdout.first().map(|line| line.trim()) {
            Some(branch) if !branch.is_empty() => Some(branch.to_string()),
            _ => {
                error!("empty output from '{}'", result.command_string());
                None
            }
        }
    }

    /// Arguments restricting a remote operation to `branch`.
    /// The default branch is left implicit since some servers cannot look
    /// up remote branches.
    fn branch_args(branch: &str) -> Vec<&str> {
        if branch == DEFAULT_BRANCH {
            Vec::new()
        } else {
            vec!["-b", branch]
        }
    }
}

#[async_trait]
impl RepositoryOperations for HgScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        let Some(branch) = self.branch().await else {
            return 1;
        };

        let mut pull = vec!["pull"];
        pull.extend(Self::branch_args(&branch));
        let result = self
            .base
            .execute(&self.base.process(self.base.command_args(&pull)))
            .await;
        info!("output of {}:", result.command_string());
        info!("{}", result.output_string().trim_end());
        if !result.is_success() {
            result.log_error("failed to perform pull");
            return 1;
        }

        // With multiple heads, the one with the highest index is most
        // likely the right one.
        let mut update = vec!["update"];
        if branch == DEFAULT_BRANCH {
            update.push("--check");
        }
        update.extend(["-r", "max(head() and branch(\".\"))"]);
        let result = self
            .base
            .execute(&self.base.process(self.base.command_args(&update)))
            .await;
        info!("output of {}:", result.command_string());
        info!("{}", result.output_string().trim_end());
        if !result.is_success() {
            result.log_error("failed to perform pull and update");
            return 1;
        }

        0
    }

    /// `hg incoming` exits with 0 when there are changes and 1 when there
    /// are none.
    async fn incoming_check(&self) -> Result<bool, ScmError> {
        let repository = self.base.descriptor().to_string();
        let branch = self.branch().await.ok_or_else(|| {
            ScmError::indeterminate(repository.clone(), "cannot get branch")
        })?;

        let mut incoming = vec!["incoming"];
        incoming.extend(Self::branch_args(&branch));
        let result = self
            .base
            .execute(&self.base.process(self.base.command_args(&incoming)))
            .await;
        info!("output of {}:", result.command_string());
        info!("{}", result.output_string().trim_end());
        match result.exit_code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                result.log_error("failed to perform incoming");
                Err(ScmError::command_failed(repository, &result))
            }
        }
    }

    async fn strip_outgoing(&self) -> Result<bool, ScmError> {
        // `hg out` exits with 1 when there is nothing outgoing.
        let process = self
            .base
            .process(self.base.command_args(&["out", "-q", "-b", ".", "--template={rev}\\n"]));
        let result = self.base.execute(&process).await;
        match result.exit_code() {
            Some(0) => {}
            Some(1) => return Ok(false),
            _ => {
                result.log_error("failed to check outgoing changesets");
                return Err(ScmError::command_failed(
                    self.base.descriptor().to_string(),
                    &result,
                ));
            }
        }

        let revisions: Vec<&str> = result
            .stdout
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect();
        if revisions.is_empty() {
            return Ok(false);
        }

        debug!(
            "Removing outgoing changesets in repository {}: {:?}",
            self.base.descriptor(),
            revisions
        );
        self.base
            .run_checked(self.base.command_args(&[
                "--config",
                "extensions.strip=",
                "strip",
                "outgoing() and branch(\".\")",
            ]))
            .await?;
        Ok(true)
    }
}
