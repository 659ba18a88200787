use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::scm_interface::{RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::RepositoryDescriptor;

/// CVS implementation of repository operations
pub struct CvsScm {
    base: ScmBase,
}

impl CvsScm {
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
impl RepositoryOperations for CvsScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        self.base.run_sync(&["update", "-dP"]).await
    }
}
