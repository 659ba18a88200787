pub mod mirror;
pub mod sync;

pub use mirror::*;
pub use sync::*;
