//! # repomirror - repository mirroring for a source indexing service
//!
//! `repomirror` keeps the working copies behind the projects of a source
//! indexing web application up to date, and runs per-project command
//! sequences (mirror, reindex, notify) across all projects in parallel.
//!
//! ## Commands
//!
//! ```bash
//! # synchronize the repositories of two projects
//! repomirror mirror -c mirror.yml foo bar
//!
//! # all indexed projects, skipping those without incoming changes
//! repomirror mirror -c mirror.yml --all --check-changes --batch
//!
//! # run the step sequence of sync.yml for every indexed project
//! repomirror sync -c sync.yml --indexed
//! ```
//!
//! ## Architecture
//!
//! - [`domain`]: configuration entities, steps and repository descriptors
//! - [`application`]: per-project mirroring, the project scheduler and the
//!   step sequence engine
//! - [`infrastructure`]: process execution, the REST client of the indexing
//!   service, repository drivers and advisory locks
//! - [`presentation`]: command line interface
//! - [`common`]: errors and the success / failure / continue outcome
//!
//! ## Using the library
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use repomirror::application::use_cases::{MirrorContext, MirrorProjectsUseCase};
//! use repomirror::domain::entities::{MirrorConfig, MirrorOverrides};
//! use repomirror::infrastructure::{IndexerClient, RestClient};
//!
//! # async fn example() -> repomirror::Result<()> {
//! let indexer = IndexerClient::new(RestClient::new()?, "http://localhost:8080/source")?;
//! let context = MirrorContext {
//!     config: Arc::new(MirrorConfig::default()),
//!     api: Arc::new(indexer),
//!     source_root: "/var/opengrok/src".into(),
//!     overrides: MirrorOverrides::default(),
//!     cancellation: None,
//! };
//!
//! let outcome = MirrorProjectsUseCase::new(context)
//!     .execute(&["foo".to_string()], false)
//!     .await?;
//! println!("exit code {}", outcome.code());
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod application;
pub mod common;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use crate::common::error::MirrorError;
pub use crate::common::outcome::Outcome;
pub use crate::common::result::MirrorResult as Result;
