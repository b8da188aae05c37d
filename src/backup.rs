//! Backup engine - drives every source through test, list and clone
//!
//! Sources are processed one after another in configuration order. Within a
//! source, repositories are prepared and cloned in listing order, optionally
//! with a bounded number running at once. Connectivity, listing and
//! filesystem faults abort the run immediately; clone failures follow the
//! configured [`FailurePolicy`].

use crate::error::BackupError;
use crate::report::{RunReporter, RunSummary};
use crate::source::{target_path, Repository, RepositorySource};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// What to do when a single repository fails to clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the whole run on the first clone error
    #[default]
    FailFast,
    /// Attempt every repository, then report the run as failed
    FailAtEnd,
}

impl FailurePolicy {
    pub fn from_fail_at_end(fail_at_end: bool) -> Self {
        if fail_at_end {
            FailurePolicy::FailAtEnd
        } else {
            FailurePolicy::FailFast
        }
    }
}

/// Run-wide settings for the engine.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Root every source directory is created under
    pub root: PathBuf,
    pub policy: FailurePolicy,
    /// Mirror repositories without a working tree
    pub bare: bool,
    /// Maximum concurrent clones within one source
    pub jobs: usize,
}

impl BackupOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: FailurePolicy::default(),
            bare: false,
            jobs: 1,
        }
    }
}

/// Counts of a finished run together with how it ended.
#[derive(Debug)]
pub struct BackupReport {
    pub summary: RunSummary,
    pub result: Result<(), BackupError>,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn exit_code(&self) -> u8 {
        match &self.result {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        }
    }
}

/// Result of handing one repository to the engine.
enum Attempt {
    /// Not started because the run is aborting
    Skipped,
    Cloned,
    Failed {
        repository: String,
        error: anyhow::Error,
    },
    /// Environment fault that ends the run regardless of policy
    Fatal(BackupError),
}

/// The engine that backs up every repository of every source
pub struct BackupEngine {
    options: BackupOptions,
}

impl BackupEngine {
    pub fn new(options: BackupOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    /// Back up all `sources` and report the outcome.
    ///
    /// The summary is always produced, also when the run was aborted.
    pub async fn run(&self, sources: &[Box<dyn RepositorySource>]) -> BackupReport {
        let mut reporter = RunReporter::start();
        let result = self.run_sources(sources, &mut reporter).await;
        let summary = reporter.finish();

        info!("{}", summary);

        BackupReport { summary, result }
    }

    async fn run_sources(
        &self,
        sources: &[Box<dyn RepositorySource>],
        reporter: &mut RunReporter,
    ) -> Result<(), BackupError> {
        if sources.is_empty() {
            return Err(BackupError::NoSources);
        }

        for source in sources {
            let source_name = source.name();
            info!("=== {} ===", source_name);

            source
                .test()
                .await
                .map_err(|error| BackupError::Connectivity {
                    source_name: source_name.to_string(),
                    error,
                })?;

            let repositories =
                source
                    .list_repositories()
                    .await
                    .map_err(|error| BackupError::Listing {
                        source_name: source_name.to_string(),
                        error,
                    })?;

            info!(
                "Found {} repositories in [{}]",
                repositories.len(),
                source_name
            );

            self.back_up_source(source_name, &repositories, reporter)
                .await?;
        }

        match reporter.errors() {
            0 => Ok(()),
            errors => Err(BackupError::CloneFailures(errors)),
        }
    }

    async fn back_up_source(
        &self,
        source_name: &str,
        repositories: &[Box<dyn Repository>],
        reporter: &mut RunReporter,
    ) -> Result<(), BackupError> {
        let abort = AtomicBool::new(false);
        let abort = &abort;

        // `buffered` starts at most `jobs` attempts and yields them in listing
        // order, so the counters below are only touched from this loop.
        let mut attempts = stream::iter(repositories)
            .map(move |repo| self.back_up_repository(source_name, repo.as_ref(), abort))
            .buffered(self.options.jobs.max(1));

        let mut fatal = None;

        while let Some(attempt) = attempts.next().await {
            match attempt {
                Attempt::Skipped => {}
                Attempt::Cloned => reporter.record_success(),
                Attempt::Failed { repository, error } => {
                    reporter.record_failure();
                    error!(
                        "Failed to clone {} from [{}]: {:#}",
                        repository, source_name, error
                    );

                    if self.options.policy == FailurePolicy::FailFast && fatal.is_none() {
                        fatal = Some(BackupError::Clone {
                            source_name: source_name.to_string(),
                            repository,
                            error,
                        });
                    }
                }
                Attempt::Fatal(e) => {
                    error!("{}", e);
                    fatal.get_or_insert(e);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn back_up_repository(
        &self,
        source_name: &str,
        repo: &dyn Repository,
        abort: &AtomicBool,
    ) -> Attempt {
        if abort.load(Ordering::SeqCst) {
            return Attempt::Skipped;
        }

        let full_name = repo.full_name();
        info!("Discovered {}", full_name);

        let target = match target_path(&self.options.root, source_name, full_name) {
            Ok(target) => target,
            Err(error) => return self.failed(full_name, error, abort),
        };

        if let Err(error) = tokio::fs::create_dir_all(&target).await {
            abort.store(true, Ordering::SeqCst);
            return Attempt::Fatal(BackupError::CreateDirectory {
                path: target,
                error,
            });
        }

        debug!("Cloning {} into {}", full_name, target.display());

        match repo.clone_into(&target, self.options.bare).await {
            Ok(()) => Attempt::Cloned,
            Err(error) => self.failed(full_name, error, abort),
        }
    }

    /// A repository-level failure, which stops new attempts under fail-fast.
    fn failed(&self, full_name: &str, error: anyhow::Error, abort: &AtomicBool) -> Attempt {
        if self.options.policy == FailurePolicy::FailFast {
            abort.store(true, Ordering::SeqCst);
        }
        Attempt::Failed {
            repository: full_name.to_string(),
            error,
        }
    }
}
