use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::source::Repository;

/// Default upper bound for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(3600);

const USERNAME_ENV: &str = "GIT_BACKUP_USERNAME";
const PASSWORD_ENV: &str = "GIT_BACKUP_PASSWORD";

// Reads the credentials from the child's environment so they never show up
// in argv or get written to the clone's config.
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { echo \"username=${GIT_BACKUP_USERNAME}\"; echo \"password=${GIT_BACKUP_PASSWORD}\"; }; f";

/// HTTP credentials handed to git for one repository.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A repository cloned and refreshed through the `git` command line.
#[derive(Debug, Clone)]
pub struct GitRepository {
    full_name: String,
    clone_url: String,
    credentials: Option<Credentials>,
    insecure: bool,
    timeout: Duration,
}

/// What a target directory currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Missing or empty, ready for a fresh clone
    Empty,
    /// A clone with a checked-out working tree
    WorkingCopy,
    /// A bare mirror
    Bare,
    /// Something that is not a git repository
    Foreign,
}

impl GitRepository {
    pub fn new(full_name: impl Into<String>, clone_url: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            clone_url: clone_url.into(),
            credentials: None,
            insecure: false,
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Skip TLS certificate verification for this repository's remote.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clone_url(&self) -> &str {
        &self.clone_url
    }

    /// A `git` command with prompts disabled, auth and TLS options applied.
    fn git(&self) -> AsyncCommand {
        let mut command = AsyncCommand::new("git");
        command
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.insecure {
            command.args(["-c", "http.sslVerify=false"]);
        }

        if let Some(credentials) = &self.credentials {
            command
                .args(["-c", "credential.helper=", "-c", CREDENTIAL_HELPER])
                .env(USERNAME_ENV, &credentials.username)
                .env(PASSWORD_ENV, &credentials.password);
        }

        command
    }

    /// Run a prepared git command, failing on timeout or a non-zero exit.
    async fn run(&self, mut command: AsyncCommand, what: &str) -> Result<String> {
        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {}s", what, self.timeout.as_secs()))?
            .with_context(|| format!("Failed to execute {}", what))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed ({}): {}", what, output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn fresh_clone(&self, path: &Path, bare: bool) -> Result<()> {
        info!("Cloning {} -> {}", self.full_name, path.display());

        let mut command = self.git();
        command.arg("clone").arg("--quiet");
        if bare {
            command.arg("--mirror");
        }
        command.arg(&self.clone_url).arg(path);

        if let Err(e) = self.run(command, "git clone").await {
            // Leave the directory empty rather than half-written
            if let Err(cleanup) = clear_directory(path).await {
                warn!(
                    "Failed to clean up {} after a failed clone: {}",
                    path.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        Ok(())
    }

    async fn update_working_copy(&self, path: &Path) -> Result<()> {
        info!("Updating {} at {}", self.full_name, path.display());

        let mut fetch = self.git();
        fetch
            .args(["fetch", "--all", "--tags", "--prune", "--quiet"])
            .current_dir(path);
        self.run(fetch, "git fetch").await?;

        // An empty remote has no upstream to fast-forward to
        let mut upstream = self.git();
        upstream
            .args(["rev-parse", "--verify", "--quiet", "@{u}"])
            .current_dir(path);
        if self.run(upstream, "git rev-parse").await.is_err() {
            debug!("{} has no upstream branch, nothing to merge", self.full_name);
            return Ok(());
        }

        let mut merge = self.git();
        merge
            .args(["merge", "--ff-only", "--quiet", "@{u}"])
            .current_dir(path);
        self.run(merge, "git merge --ff-only").await?;

        Ok(())
    }

    async fn update_mirror(&self, path: &Path) -> Result<()> {
        info!("Updating mirror {} at {}", self.full_name, path.display());

        let mut update = self.git();
        update
            .args(["remote", "update", "--prune"])
            .current_dir(path);
        self.run(update, "git remote update").await?;

        Ok(())
    }

    /// Refuse to update a directory that holds a clone of another repository.
    async fn ensure_same_remote(&self, path: &Path) -> Result<()> {
        let mut get_url = self.git();
        get_url
            .args(["config", "--get", "remote.origin.url"])
            .current_dir(path);

        let actual = self
            .run(get_url, "git config")
            .await
            .with_context(|| format!("{} has no origin remote", path.display()))?;

        if !remote_urls_match(&actual, &self.clone_url) {
            bail!(
                "{} holds a clone of {}, expected {}",
                path.display(),
                actual,
                self.clone_url
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn full_name(&self) -> &str {
        &self.full_name
    }

    async fn clone_into(&self, target: &Path, bare: bool) -> Result<()> {
        match local_state(target).await? {
            LocalState::Empty => self.fresh_clone(target, bare).await,
            LocalState::WorkingCopy => {
                if bare {
                    warn!(
                        "{} is a working copy, updating it instead of mirroring",
                        target.display()
                    );
                }
                self.ensure_same_remote(target).await?;
                self.update_working_copy(target).await
            }
            LocalState::Bare => {
                if !bare {
                    warn!(
                        "{} is a bare mirror, updating it instead of checking out",
                        target.display()
                    );
                }
                self.ensure_same_remote(target).await?;
                self.update_mirror(target).await
            }
            LocalState::Foreign => Err(anyhow!(
                "{} is not empty and does not contain a git repository",
                target.display()
            )),
        }
    }
}

/// Inspect a target directory without modifying it.
pub async fn local_state(path: &Path) -> Result<LocalState> {
    if !path.exists() {
        return Ok(LocalState::Empty);
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("Failed to read directory {}", path.display()))?;
    if entries.next_entry().await?.is_none() {
        return Ok(LocalState::Empty);
    }

    if path.join(".git").exists() {
        return Ok(LocalState::WorkingCopy);
    }

    if path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir() {
        return Ok(LocalState::Bare);
    }

    Ok(LocalState::Foreign)
}

/// Remove everything inside `path`, keeping the directory itself.
async fn clear_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&entry_path).await?;
        } else {
            tokio::fs::remove_file(&entry_path).await?;
        }
    }

    Ok(())
}

/// Compare remote URLs ignoring `.git` suffixes, case, embedded user info
/// and SSH vs HTTPS spelling.
pub fn remote_urls_match(actual: &str, expected: &str) -> bool {
    fn normalize(url: &str) -> String {
        let url = url.trim().trim_end_matches('/').trim_end_matches(".git");
        let url = match url.split_once("://") {
            Some((scheme, rest)) => {
                let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
                format!("{}://{}", scheme, rest)
            }
            None => match url.strip_prefix("git@").and_then(|r| r.split_once(':')) {
                Some((host, path)) => format!("https://{}/{}", host, path),
                None => url.to_string(),
            },
        };
        url.replace("ssh://", "https://").to_lowercase()
    }

    normalize(actual) == normalize(expected)
}
