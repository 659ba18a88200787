/// Infrastructure layer modules
///
/// This layer provides concrete implementations for external system interactions:
/// - Process execution with bounded output capture and timeouts
/// - Repository drivers (Git, Mercurial, Subversion, CVS, Perforce, repo, Teamware)
/// - REST client of the indexing service
/// - Configuration files and advisory locks
pub mod filesystem;
pub mod http;
pub mod process;
pub mod scm;

// Re-export commonly used types
pub use filesystem::{AdvisoryLock, ConfigStore, LockSet};
pub use http::{IndexerApi, IndexerClient, RestClient, RestError};
pub use process::{CommandExecutor, ExecutionResult, ProcessDescriptor};
pub use scm::{RepositoryOperations, ScmError, ScmFactory};
