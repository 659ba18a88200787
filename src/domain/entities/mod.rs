pub mod mirror_config;
pub mod repository;
pub mod step;

pub use mirror_config::{MirrorConfig, MirrorOverrides, ProjectConfig, ProjectSettings};
pub use repository::{CommandEntry, RepositoryDescriptor};
pub use step::{ApiCall, CommandStep, Step, SyncConfig};
