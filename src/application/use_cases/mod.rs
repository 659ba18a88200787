pub mod command_sequence;
pub mod mirror_project;
pub mod mirror_projects;
pub mod sync_projects;

pub use command_sequence::{CommandSequence, SequenceReport, StepRecord};
pub use mirror_project::{MirrorContext, MirrorProjectUseCase};
pub use mirror_projects::MirrorProjectsUseCase;
pub use sync_projects::{ProjectSelection, SyncProjectsUseCase};
