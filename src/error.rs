//! Run-level error taxonomy and the exit codes it maps onto.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a missing, unreadable or invalid configuration file.
pub const EXIT_CONFIG: u8 = 1;
/// Exit code for a clone failure or a filesystem fault while preparing a target.
pub const EXIT_BACKUP_FAILED: u8 = 100;
/// Exit code for a source that could not be reached or listed.
pub const EXIT_COMMUNICATION: u8 = 110;
/// Exit code for a configuration file that yields no sources.
pub const EXIT_NO_SOURCES: u8 = 111;

/// Everything that can end a backup run unsuccessfully.
///
/// Only [`BackupError::Clone`] and [`BackupError::CloneFailures`] depend on the
/// failure policy; every other variant aborts the run as soon as it happens.
#[derive(Error, Debug)]
pub enum BackupError {
    /// No configuration file at the given path
    #[error("No config file found at {0}")]
    ConfigMissing(PathBuf),

    /// The configuration file could not be read or parsed
    #[error("Invalid configuration: {0:#}")]
    Config(#[source] anyhow::Error),

    /// The configuration parsed but declared no sources
    #[error("Found a config file but detected no sources. Are you sure the file is properly formed?")]
    NoSources,

    /// A source failed its connectivity test
    #[error("Failed to verify connection to job [{source_name}]: {error:#}")]
    Connectivity {
        source_name: String,
        #[source]
        error: anyhow::Error,
    },

    /// A source could not list its repositories
    #[error("Communication error while listing [{source_name}]: {error:#}")]
    Listing {
        source_name: String,
        #[source]
        error: anyhow::Error,
    },

    /// A target directory could not be created
    #[error("Failed to create directory {}: {error}", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// A clone failed under the fail-fast policy
    #[error("Failed to clone {repository} from [{source_name}]: {error:#}")]
    Clone {
        source_name: String,
        repository: String,
        #[source]
        error: anyhow::Error,
    },

    /// One or more clones failed under the fail-at-end policy
    #[error("{0} repositories failed to back up")]
    CloneFailures(usize),
}

impl BackupError {
    /// The process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::ConfigMissing(_) | BackupError::Config(_) => EXIT_CONFIG,
            BackupError::NoSources => EXIT_NO_SOURCES,
            BackupError::Connectivity { .. } | BackupError::Listing { .. } => EXIT_COMMUNICATION,
            BackupError::CreateDirectory { .. }
            | BackupError::Clone { .. }
            | BackupError::CloneFailures(_) => EXIT_BACKUP_FAILED,
        }
    }
}
