use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

/// Perforce (P4) implementation of repository operations
pub struct P4Scm {
    base: ScmBase,
}

impl P4Scm {
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
impl RepositoryOperations for P4Scm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        self.base.run_sync(&["sync"]).await
    }

    /// A preview sync lists one line per file to update; a workspace with
    /// nothing to do only reports that files are up-to-date.
    async fn incoming_check(&self) -> Result<bool, ScmError> {
        let result = self.base.run_checked(self.base.command_args(&["sync", "-n"])).await?;
        Ok(result
            .stdout
            .iter()
            .any(|line| !line.trim().is_empty() && !line.contains("up-to-date")))
    }
}
