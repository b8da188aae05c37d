//! Common test utilities: in-memory sources and repositories for driving the engine

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use git_backup::{GitRepository, Repository, RepositorySource};

/// One call to `clone_into` as seen by a fake repository
#[derive(Debug, Clone, PartialEq)]
pub struct CloneAttempt {
    pub full_name: String,
    pub target: PathBuf,
    pub bare: bool,
}

/// Shared record of every clone attempt, in the order they happened
#[derive(Debug, Clone, Default)]
pub struct CloneLog(Arc<Mutex<Vec<CloneAttempt>>>);

impl CloneLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<CloneAttempt> {
        self.0.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.attempts().into_iter().map(|a| a.full_name).collect()
    }

    fn push(&self, attempt: CloneAttempt) {
        self.0.lock().unwrap().push(attempt);
    }
}

/// Repository whose clone either writes a marker file or fails
pub struct FakeRepository {
    full_name: String,
    fail: bool,
    log: CloneLog,
}

#[async_trait]
impl Repository for FakeRepository {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    async fn clone_into(&self, target: &Path, bare: bool) -> Result<()> {
        self.log.push(CloneAttempt {
            full_name: self.full_name.clone(),
            target: target.to_path_buf(),
            bare,
        });

        if self.fail {
            bail!("simulated clone failure for {}", self.full_name);
        }

        // Same marker on every run, like a refreshed clone
        std::fs::write(target.join("HEAD"), format!("{}\n", self.full_name))?;
        Ok(())
    }
}

/// Source serving a fixed list of fake repositories
pub struct FakeSource {
    name: String,
    test_error: Option<String>,
    list_error: Option<String>,
    repos: Vec<(String, bool)>,
    log: CloneLog,
    list_calls: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn new(name: &str, log: &CloneLog) -> Self {
        Self {
            name: name.to_string(),
            test_error: None,
            list_error: None,
            repos: Vec::new(),
            log: log.clone(),
            list_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_repo(mut self, full_name: &str) -> Self {
        self.repos.push((full_name.to_string(), false));
        self
    }

    pub fn with_failing_repo(mut self, full_name: &str) -> Self {
        self.repos.push((full_name.to_string(), true));
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.test_error = Some("401 Unauthorized".to_string());
        self
    }

    pub fn broken_listing(mut self) -> Self {
        self.list_error = Some("connection reset by peer".to_string());
        self
    }

    /// Counter of `list_repositories` calls, readable after the source is boxed
    pub fn list_calls(&self) -> Arc<AtomicUsize> {
        self.list_calls.clone()
    }

    pub fn boxed(self) -> Box<dyn RepositorySource> {
        Box::new(self)
    }
}

#[async_trait]
impl RepositorySource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test(&self) -> Result<()> {
        match &self.test_error {
            Some(e) => bail!("{}", e),
            None => Ok(()),
        }
    }

    async fn list_repositories(&self) -> Result<Vec<Box<dyn Repository>>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = &self.list_error {
            bail!("{}", e);
        }

        Ok(self
            .repos
            .iter()
            .map(|(full_name, fail)| {
                Box::new(FakeRepository {
                    full_name: full_name.clone(),
                    fail: *fail,
                    log: self.log.clone(),
                }) as Box<dyn Repository>
            })
            .collect())
    }
}

/// Source serving real repositories from local upstream directories
pub struct LocalSource {
    name: String,
    repos: Vec<(String, PathBuf)>,
}

impl LocalSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            repos: Vec::new(),
        }
    }

    pub fn with_repo(mut self, full_name: &str, upstream: &Path) -> Self {
        self.repos.push((full_name.to_string(), upstream.to_path_buf()));
        self
    }
}

#[async_trait]
impl RepositorySource for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test(&self) -> Result<()> {
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Box<dyn Repository>>> {
        Ok(self
            .repos
            .iter()
            .map(|(full_name, upstream)| {
                Box::new(GitRepository::new(full_name.clone(), upstream.to_string_lossy()))
                    as Box<dyn Repository>
            })
            .collect())
    }
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Create an upstream repository with a single commit
pub fn create_upstream(dir: &Path) {
    std::fs::create_dir_all(dir).expect("Failed to create upstream dir");

    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("Failed to run git");
        assert!(status.success(), "git {:?} failed", args);
    };

    git(&["init", "--quiet"]);
    std::fs::write(dir.join("README.md"), "hello\n").expect("Failed to write README");
    git(&["add", "README.md"]);
    git(&["commit", "--quiet", "-m", "initial"]);
}

/// Every directory under `root`, relative to it and sorted
pub fn directory_set(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).expect("Failed to read dir") {
            let path = entry.expect("Failed to read entry").path();
            if path.is_dir() {
                out.push(path.strip_prefix(root).unwrap().to_path_buf());
                walk(root, &path, out);
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
