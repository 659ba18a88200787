pub mod hook_runner;

pub use hook_runner::{HookKind, HookRunner};
