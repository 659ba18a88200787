use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::entities::repository::{CommandEntry, RepositoryDescriptor};
use crate::domain::entities::step::PROJECT_SUBST;
use crate::infrastructure::process::{
    is_executable, CommandExecutor, ExecutionResult, ProcessDescriptor,
};

/// Common interface of all repository drivers
///
/// `sync` never fails: abnormal termination is reported as exit code 1.
/// `incoming` and `strip_outgoing` fail when the state of the working copy
/// cannot be established, which is distinct from "no changes".
#[async_trait]
pub trait RepositoryOperations: Send + Sync {
    /// Shared command plumbing of the driver
    fn base(&self) -> &ScmBase;

    fn descriptor(&self) -> &RepositoryDescriptor {
        self.base().descriptor()
    }

    /// One-time preparation of the working copy before any other operation
    async fn prepare(&self) -> Result<(), ScmError> {
        Ok(())
    }

    /// Built-in synchronization of this SCM; 0 on success
    async fn repo_sync(&self) -> i32;

    /// Built-in incoming check; drivers without one assume changes
    async fn incoming_check(&self) -> Result<bool, ScmError> {
        Ok(true)
    }

    /// Discard local-only changes; returns whether anything was discarded
    async fn strip_outgoing(&self) -> Result<bool, ScmError> {
        Ok(false)
    }

    /// Whether processing of the project's repositories stops after this one
    fn top_level(&self) -> bool {
        self.descriptor().is_top_level()
    }

    /// Driver specific validation of the resolved command
    fn check_executable(&self) -> bool {
        self.base().check_executable_file()
    }

    /// Synchronize, using the configured `sync` command when present
    async fn sync(&self) -> i32 {
        match self.descriptor().sync_override() {
            Some(args) => self.base().run_custom_sync(args).await,
            None => self.repo_sync().await,
        }
    }

    /// Check for incoming changes, using the configured `incoming` command
    /// when present
    async fn incoming(&self) -> Result<bool, ScmError> {
        match self.descriptor().incoming_override() {
            Some(args) => self.base().run_custom_incoming(args).await,
            None => self.incoming_check().await,
        }
    }

    /// Validate the command configuration without running anything
    fn check_command(&self) -> bool {
        self.base().check_command_keys() && self.check_executable()
    }
}

/// Errors that can occur during repository operations
#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("SCM executable not found: {executable}")]
    ExecutableNotFound { executable: String },

    #[error("Unsupported repository type: {name}")]
    UnsupportedType { name: String },

    #[error("Invalid command configuration for {repository}: {message}")]
    InvalidCommand { repository: String, message: String },

    #[error("Command '{command}' failed in {repository} ({status}): {output}")]
    CommandFailed {
        repository: String,
        command: String,
        status: String,
        output: String,
    },

    #[error("Cannot determine state of repository {repository}: {message}")]
    IndeterminateState { repository: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScmError {
    pub fn executable_not_found(executable: impl Into<String>) -> Self {
        Self::ExecutableNotFound {
            executable: executable.into(),
        }
    }

    pub fn unsupported_type(name: impl Into<String>) -> Self {
        Self::UnsupportedType { name: name.into() }
    }

    pub fn invalid_command(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Create a command failed error from an execution result
    pub fn command_failed(repository: impl Into<String>, result: &ExecutionResult) -> Self {
        let status = match result.exit_code() {
            Some(code) => format!("exit code {}", code),
            None => result.state.to_string(),
        };
        Self::CommandFailed {
            repository: repository.into(),
            command: result.command_string(),
            status,
            output: result.combined_output().trim_end().to_string(),
        }
    }

    pub fn indeterminate(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IndeterminateState {
            repository: repository.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Look up an executable in `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Command plumbing shared by the repository drivers
#[derive(Debug, Clone)]
pub struct ScmBase {
    descriptor: RepositoryDescriptor,
    command: PathBuf,
    cancellation: Option<CancellationToken>,
}

impl ScmBase {
    /// Resolve the command from the configuration, or from `PATH` using the
    /// standard executable name of the SCM.
    pub fn new(
        descriptor: RepositoryDescriptor,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ScmError> {
        let command = match descriptor.commands.as_ref().and_then(CommandEntry::executable) {
            Some(command) => command,
            None => {
                let name = descriptor.scm_type.executable_name();
                find_in_path(name).ok_or_else(|| ScmError::executable_not_found(name))?
            }
        };
        Ok(Self::with_command(descriptor, command, cancellation))
    }

    pub fn with_command(
        descriptor: RepositoryDescriptor,
        command: PathBuf,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            descriptor,
            command,
            cancellation,
        }
    }

    pub fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.descriptor.path
    }

    /// Resolved command (an executable, or a tool directory for Teamware)
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Argument vector starting with the resolved command
    pub fn command_args(&self, args: &[&str]) -> Vec<String> {
        let mut command = vec![self.command.display().to_string()];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command
    }

    /// Process descriptor running in the working copy with the repository
    /// environment and timeout
    pub fn process(&self, args: Vec<String>) -> ProcessDescriptor {
        ProcessDescriptor::new(args)
            .with_working_directory(&self.descriptor.path)
            .with_env(&self.descriptor.env)
            .with_timeout(self.descriptor.timeout)
            .with_cancellation(self.cancellation.clone())
    }

    pub async fn execute(&self, process: &ProcessDescriptor) -> ExecutionResult {
        debug!("Running '{}' in {}", process.command_line().join(" "), self.descriptor);
        CommandExecutor::execute(process).await
    }

    /// Run a command in the working copy.
    ///
    /// Returns the status and the output. A process that did not finish
    /// reports status 1; on failure the output includes stderr.
    pub async fn run_command(&self, process: &ProcessDescriptor) -> (i32, String) {
        let result = self.execute(process).await;
        if result.is_success() {
            return (0, result.output_string());
        }

        result.log_error(&format!("failed to perform command in {}", self.descriptor));
        let status = match result.exit_code() {
            Some(code) if code != 0 => code,
            _ => 1,
        };
        let output = [result.output_string(), result.error_output_string()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        (status, output)
    }

    /// Run a command and fail unless it exits with 0.
    pub async fn run_checked(&self, args: Vec<String>) -> Result<ExecutionResult, ScmError> {
        let result = self.execute(&self.process(args)).await;
        if result.is_success() {
            Ok(result)
        } else {
            result.log_error(&format!("failed to perform command in {}", self.descriptor));
            Err(ScmError::command_failed(self.descriptor.to_string(), &result))
        }
    }

    /// Log output of a command at info on success and warn on failure
    pub fn log_sync_output(&self, result: &ExecutionResult) {
        if result.is_success() {
            info!("output of '{}':", result.command_string());
            info!("{}", result.output_string().trim_end());
        } else {
            warn!("output of '{}':", result.command_string());
            warn!("{}", result.combined_output().trim_end());
        }
    }

    /// Run a built-in sync command; 0 on success, 1 otherwise
    pub async fn run_sync(&self, args: &[&str]) -> i32 {
        let result = self.execute(&self.process(self.command_args(args))).await;
        self.log_sync_output(&result);
        if result.is_success() {
            0
        } else {
            result.log_error(&format!("failed to synchronize {}", self.descriptor));
            1
        }
    }

    /// Process for a configured override: `%PROJECT%` is replaced with the
    /// project name, which is appended when nothing was replaced.
    fn custom_process(&self, args: Vec<String>) -> ProcessDescriptor {
        let project = self.descriptor.project.clone();
        self.process(args)
            .with_substitution(PROJECT_SUBST, project.clone())
            .with_append(vec![project], true)
    }

    pub async fn run_custom_sync(&self, args: Vec<String>) -> i32 {
        let process = self.custom_process(args);
        let command = process.command_line().join(" ");
        let (status, output) = self.run_command(&process).await;
        if status == 0 {
            info!("output of '{}':", command);
            info!("{}", output.trim_end());
        } else {
            warn!("output of '{}':", command);
            warn!("{}", output.trim_end());
        }
        status
    }

    /// Any output of a successful custom incoming command means changes.
    pub async fn run_custom_incoming(&self, args: Vec<String>) -> Result<bool, ScmError> {
        let process = self.custom_process(args);
        let command = process.command_line().join(" ");
        let (status, output) = self.run_command(&process).await;
        if status != 0 {
            error!("output of '{}':", command);
            error!("{}", output.trim_end());
            return Err(ScmError::indeterminate(
                self.descriptor.to_string(),
                "failed to check for incoming changes",
            ));
        }
        Ok(!output.trim().is_empty())
    }

    /// Only `command`, `sync` and `incoming` may be configured.
    pub fn check_command_keys(&self) -> bool {
        let Some(commands) = self.descriptor.commands.as_ref() else {
            return true;
        };
        let unknown = commands.unknown_keys();
        if let Some(key) = unknown.first() {
            error!(
                "Unknown property '{}' for '{}'",
                key,
                self.descriptor.scm_type.config_key()
            );
            return false;
        }
        true
    }

    pub fn check_executable_file(&self) -> bool {
        if !self.command.exists() {
            error!(
                "path for '{}' does not exist: {}",
                self.descriptor.scm_type.config_key(),
                self.command.display()
            );
            return false;
        }
        if !self.command.is_file() || !is_executable(&self.command) {
            error!(
                "path for '{}' is not an executable file: {}",
                self.descriptor.scm_type.config_key(),
                self.command.display()
            );
            return false;
        }
        true
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::entities::repository::ArgList;
    use crate::domain::value_objects::scm_type::ScmType;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Plain {
        base: ScmBase,
    }

    #[async_trait]
    impl RepositoryOperations for Plain {
        fn base(&self) -> &ScmBase {
            &self.base
        }

        async fn repo_sync(&self) -> i32 {
            0
        }
    }

    fn table(entries: &[(&str, &str)]) -> CommandEntry {
        CommandEntry::Table(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), ArgList::One(v.to_string())))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn plain(dir: &Path, commands: CommandEntry) -> Plain {
        let descriptor = RepositoryDescriptor::new(ScmType::Cvs, dir, "proj").with_commands(Some(commands));
        Plain {
            base: ScmBase::new(descriptor, None).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_defaults_without_native_primitives() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let repo = plain(temp_dir.path(), CommandEntry::Path(tool.display().to_string()));

        assert!(repo.incoming().await.unwrap());
        assert!(!repo.strip_outgoing().await.unwrap());
        assert!(!repo.top_level());
        assert!(repo.check_command());
    }

    #[tokio::test]
    async fn test_custom_sync_appends_project() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let sync = recording_script(temp_dir.path(), "sync.sh", "exit 0");
        let repo = plain(
            temp_dir.path(),
            table(&[("command", tool.to_str().unwrap()), ("sync", sync.to_str().unwrap())]),
        );

        assert_eq!(repo.sync().await, 0);
        assert_eq!(recorded_calls(temp_dir.path()), vec!["proj".to_string()]);
    }

    #[tokio::test]
    async fn test_custom_sync_failure_returns_status() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let sync = write_script(temp_dir.path(), "sync.sh", "echo broken >&2\nexit 3");
        let repo = plain(
            temp_dir.path(),
            table(&[("command", tool.to_str().unwrap()), ("sync", sync.to_str().unwrap())]),
        );

        assert_eq!(repo.sync().await, 3);
    }

    #[tokio::test]
    async fn test_custom_incoming() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let changes = write_script(temp_dir.path(), "changes.sh", "echo abc123");
        let quiet = write_script(temp_dir.path(), "quiet.sh", "exit 0");
        let broken = write_script(temp_dir.path(), "broken.sh", "exit 1");

        let with = |script: &Path| {
            plain(
                temp_dir.path(),
                table(&[("command", tool.to_str().unwrap()), ("incoming", script.to_str().unwrap())]),
            )
        };

        assert!(with(&changes).incoming().await.unwrap());
        assert!(!with(&quiet).incoming().await.unwrap());
        assert!(matches!(
            with(&broken).incoming().await,
            Err(ScmError::IndeterminateState { .. })
        ));
    }

    #[tokio::test]
    async fn test_check_command_rejects_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let repo = plain(
            temp_dir.path(),
            table(&[("command", tool.to_str().unwrap()), ("pull", "x")]),
        );
        assert!(!repo.check_command());
    }

    #[test]
    fn test_check_command_rejects_missing_or_non_executable() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        let repo = plain(temp_dir.path(), CommandEntry::Path(missing.display().to_string()));
        assert!(!repo.check_command());

        let text = temp_dir.path().join("text");
        std::fs::write(&text, "not a program").unwrap();
        let repo = plain(temp_dir.path(), CommandEntry::Path(text.display().to_string()));
        assert!(!repo.check_command());
    }

    #[test]
    fn test_missing_default_executable() {
        let descriptor = RepositoryDescriptor::new(ScmType::Cvs, "/nonexistent", "proj")
            .with_commands(Some(CommandEntry::Path("/nonexistent/cvs".to_string())));
        assert!(ScmBase::new(descriptor, None).is_ok());
        assert!(find_in_path("surely-not-an-installed-program-name").is_none());
    }

    #[tokio::test]
    async fn test_run_command_reports_abnormal_termination() {
        let temp_dir = TempDir::new().unwrap();
        let tool = write_script(temp_dir.path(), "tool", "exit 0");
        let repo = plain(temp_dir.path(), CommandEntry::Path(tool.display().to_string()));

        let process = repo
            .base
            .process(vec!["sleep".to_string(), "5".to_string()])
            .with_timeout(Some(std::time::Duration::from_millis(100)));
        let (status, _) = repo.base.run_command(&process).await;
        assert_eq!(status, 1);
    }
}
