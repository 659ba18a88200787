pub mod error;
pub mod outcome;
pub mod result;

pub use error::MirrorError;
pub use outcome::Outcome;
pub use result::MirrorResult;
