use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::cvs_scm::CvsScm;
use super::git_scm::GitScm;
use super::hg_scm::HgScm;
use super::p4_scm::P4Scm;
use super::repo_scm::RepoScm;
use super::scm_interface::{RepositoryOperations, ScmError};
use super::svn_scm::SvnScm;
use super::teamware_scm::TeamwareScm;
use crate::domain::entities::repository::RepositoryDescriptor;
use crate::domain::value_objects::scm_type::ScmType;

/// Factory for creating repository drivers
pub struct ScmFactory;

impl ScmFactory {
    /// Create the driver matching the type of the descriptor
    pub fn create(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Arc<dyn RepositoryOperations>, ScmError> {
        let driver: Arc<dyn RepositoryOperations> = match descriptor.scm_type {
            ScmType::Git => Arc::new(GitScm::new(descriptor, cancellation)?),
            ScmType::Mercurial => Arc::new(HgScm::new(descriptor, cancellation)?),
            ScmType::Subversion => Arc::new(SvnScm::new(descriptor, cancellation)?),
            ScmType::Cvs => Arc::new(CvsScm::new(descriptor, cancellation)?),
            ScmType::Perforce => Arc::new(P4Scm::new(descriptor, cancellation)?),
            ScmType::Repo => Arc::new(RepoScm::new(descriptor, cancellation)?),
            ScmType::Teamware => Arc::new(TeamwareScm::new(descriptor, cancellation)?),
        };
        Ok(driver)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::entities::repository::CommandEntry;
    use crate::infrastructure::scm::scm_interface::test_support::write_script;
    use tempfile::TempDir;

    #[test]
    fn test_create_every_type() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");

        for scm_type in ScmType::ALL {
            let command = if scm_type == ScmType::Teamware {
                temp_dir.path().display().to_string()
            } else {
                tool.display().to_string()
            };
            let descriptor = RepositoryDescriptor::new(scm_type, temp_dir.path(), "proj")
                .with_commands(Some(CommandEntry::Path(command)));
            let driver = ScmFactory::create(descriptor, None).unwrap();
            assert_eq!(driver.descriptor().scm_type, scm_type);
            assert_eq!(driver.top_level(), scm_type == ScmType::Repo);
            assert!(driver.check_command(), "{}", scm_type);
        }
    }
}
