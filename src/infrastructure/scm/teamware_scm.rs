use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::scm_interface::{find_in_path, RepositoryOperations, ScmBase, ScmError};
use crate::domain::entities::repository::{CommandEntry, RepositoryDescriptor};

/// Metadata directory of a Teamware workspace
const WORKSPACE_DATA_DIR: &str = "Codemgr_wsdata";

/// Teamware (SCCS based) implementation of repository operations
///
/// The configured command is the directory holding the Teamware tools;
/// it is put in front of `PATH` since `bringover` runs the SCCS tools.
pub struct TeamwareScm {
    base: ScmBase,
}

impl TeamwareScm {
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        let tool_dir = match descriptor.commands.as_ref().and_then(CommandEntry::executable) {
            Some(dir) => dir,
            None => {
                let name = descriptor.scm_type.executable_name();
                find_in_path(name)
                    .and_then(|bringover| bringover.parent().map(PathBuf::from))
                    .ok_or_else(|| ScmError::executable_not_found(name))?
            }
        };

        let mut descriptor = descriptor;
        let search_path = match std::env::var_os("PATH") {
            Some(path) => {
                let mut dirs = vec![tool_dir.clone()];
                dirs.extend(std::env::split_paths(&path));
                std::env::join_paths(dirs)
                    .map_err(|e| ScmError::internal(format!("cannot extend PATH: {}", e)))?
            }
            None => tool_dir.clone().into_os_string(),
        };
        descriptor
            .env
            .insert("PATH".to_string(), search_path.to_string_lossy().into_owned());

        Ok(Self {
            base: ScmBase::with_command(descriptor, tool_dir, cancellation),
        })
    }
}

#[async_trait]
impl RepositoryOperations for TeamwareScm {
    fn base(&self) -> &ScmBase {
        &self.base
    }

    async fn repo_sync(&self) -> i32 {
        if !self.base.path().join(WORKSPACE_DATA_DIR).is_dir() {
            debug!("Not a Teamware workspace: {}, not syncing", self.base.descriptor());
            return 0;
        }

        let bringover = self.base.command().join("bringover").display().to_string();
        let process = self.base.process(vec![bringover]);
        let result = self.base.execute(&process).await;
        self.base.log_sync_output(&result);
        if result.is_success() {
            0
        } else {
            result.log_error("failed to perform bringover");
            1
        }
    }

    fn check_executable(&self) -> bool {
        if !self.base.command().is_dir() {
            error!(
                "path for '{}' is not a directory: {}",
                self.base.descriptor().scm_type.config_key(),
                self.base.command().display()
            );
            return false;
        }
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::value_objects::scm_type::ScmType;
    use crate::infrastructure::scm::scm_interface::test_support::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn teamware(tool_dir: &std::path::Path, work_dir: &std::path::Path) -> TeamwareScm {
        let descriptor = RepositoryDescriptor::new(ScmType::Teamware, work_dir, "onnv")
            .with_commands(Some(CommandEntry::Path(tool_dir.display().to_string())));
        TeamwareScm::new(descriptor, None).unwrap()
    }

    #[tokio::test]
    async fn test_sync_runs_bringover_with_tool_dir_in_path() {
        let tools = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::create_dir(work.path().join(WORKSPACE_DATA_DIR)).unwrap();
        write_script(tools.path(), "bringover", "echo \"$PATH\" > path.log");

        let repo = teamware(tools.path(), work.path());
        assert!(repo.check_command());
        assert_eq!(repo.sync().await, 0);

        let path = fs::read_to_string(work.path().join("path.log")).unwrap();
        assert!(path.starts_with(&tools.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_sync_skips_non_workspace() {
        let tools = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_script(tools.path(), "bringover", "exit 1");

        assert_eq!(teamware(tools.path(), work.path()).sync().await, 0);
    }

    #[test]
    fn test_check_command_requires_directory() {
        let tools = TempDir::new().unwrap();
        let file = write_script(tools.path(), "bringover", "exit 0");
        assert!(!teamware(&file, tools.path()).check_command());
    }
}
