//! Repository drivers
//!
//! One driver per supported SCM, all sharing the command plumbing of
//! [`ScmBase`] and running their commands through the process executor.

pub mod cvs_scm;
pub mod git_scm;
pub mod hg_scm;
pub mod p4_scm;
pub mod repo_scm;
pub mod scm_factory;
pub mod scm_interface;
pub mod svn_scm;
pub mod teamware_scm;

pub use scm_factory::ScmFactory;
pub use scm_interface::{find_in_path, RepositoryOperations, ScmBase, ScmError};
