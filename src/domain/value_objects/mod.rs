pub mod scm_type;

pub use scm_type::ScmType;
