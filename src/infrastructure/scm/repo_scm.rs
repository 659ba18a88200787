use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

/// `repo` meta-tool managing a tree of Git repositories
///
/// The tool synchronizes every repository below its own, so the project's
/// remaining repositories are not processed separately.
pub struct RepoScm {
    base: ScmBase,
}

impl RepoScm {
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        Ok(Self {
            base: ScmBase::new(descriptor, cancellation)?,
        })
    }
}

#[async_trait]
impl RepositoryOperations for RepoScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        self.base.run_sync(&["sync", "-cf"]).await
    }

    async fn incoming_check(&self) -> Result<bool, ScmError> {
        self.base.run_checked(self.base.command_args(&["sync", "-n"])).await?;
        let result = self
            .base
            .run_checked(self.base.command_args(&[
                "forall",
                "-c",
                "git log --oneline HEAD..@{upstream}",
            ]))
            .await?;
        Ok(!result.output_string().trim().is_empty())
    }

    fn top_level(&self) -> bool {
        true
    }
}
