pub mod command_executor;
pub mod output_buffer;

pub use command_executor::{
    fill_args,
    is_executable,
    CommandExecutor,
    ExecutionResult,
    ExecutionState,
    ProcessDescriptor,
    ResourceLimit,
};
pub use output_buffer::OutputBuffer;
