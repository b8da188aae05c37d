//! git-backup - Back up every repository of your git hosting accounts
//!
//! git-backup enumerates the repositories of each configured source (a GitHub
//! or GitLab account), then clones or refreshes every one of them under
//! `<root>/<source name>/<repository full name>`.
//!
//! ## Modules
//!
//! - [`backup`]: The engine driving sources, failure policy and counters
//! - [`source`]: The traits every hosting provider implements
//! - [`config`]: YAML configuration and source construction
//! - [`github`] / [`gitlab`]: Provider implementations
//! - [`git`]: Cloning and updating through the `git` command line
//! - [`upload`]: Optional upload of the finished backup

pub mod backup;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod gitlab;
pub mod report;
pub mod source;
pub mod upload;

pub use backup::{BackupEngine, BackupOptions, BackupReport, FailurePolicy};
pub use config::{Config, ProviderOptions};
pub use error::BackupError;
pub use git::GitRepository;
pub use report::{RunReporter, RunSummary};
pub use source::{Repository, RepositorySource};
